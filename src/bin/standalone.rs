use doh_bridge::config::{normalize_mtu, EngineConfig, DEFAULT_MTU};
use doh_bridge::engine::Engine;
use doh_bridge::logger::{self, BreadcrumbFlags, LogLevel, LogSink};
use doh_bridge::resolver::{Transaction, TransactionListener};
use std::env;
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

fn main() -> anyhow::Result<()> {
    let settings = Settings::parse()?;
    install_log_sink(&settings);
    eprintln!(
        "[standalone] launching doh-bridge (mtu={}, tun={}, server={})",
        settings.mtu,
        settings.tun_name,
        settings.url.as_deref().unwrap_or("<default>")
    );

    let config = EngineConfig {
        mtu: settings.mtu,
        history_enabled: settings.history,
        ..EngineConfig::default()
    };
    let addressing = config.addressing;
    let engine = Engine::new(config)?;
    engine.set_server(settings.url.as_deref())?;
    let listener: Arc<dyn TransactionListener> = Arc::new(PrintTransactions);
    engine.set_transaction_listener(Some(listener));

    let tun = platform::open_tun(&settings.tun_name)?;
    println!(
        "[standalone] opened {}. Configure it (as root) via:\n  ip addr add {}/{} dev {}\n  ip link set {} up\nthen point the resolver at {}.",
        settings.tun_name,
        addressing.ipv4_device,
        addressing.ipv4_prefix,
        settings.tun_name,
        settings.tun_name,
        addressing.ipv4_dns
    );
    let device = doh_bridge::device::FdTunDevice::from_file(tun, &addressing);
    engine.start_tunnel(Arc::new(device))?;

    platform::install_interrupt_handler();
    thread::Builder::new()
        .name("stdin-watch".into())
        .spawn(watch_stdin)?;

    println!("[standalone] engine running. Press Ctrl+C or close stdin to terminate.");
    let mut last_report = Instant::now();
    while !SHUTDOWN.load(Ordering::Acquire) {
        thread::sleep(Duration::from_millis(250));
        if last_report.elapsed() >= Duration::from_secs(5) {
            let counters = engine.counters();
            println!(
                "[standalone] answered={} last_minute={} send_fail={} http_error={} bad_response={} canceled={}",
                counters.num_requests,
                counters.recent_queries,
                counters.send_failures,
                counters.http_errors,
                counters.bad_responses,
                counters.canceled
            );
            last_report = Instant::now();
        }
    }

    println!("[standalone] shutting down");
    engine.stop();
    Ok(())
}

#[derive(Debug)]
struct Settings {
    url: Option<String>,
    mtu: usize,
    tun_name: String,
    history: bool,
    log_level: LogLevel,
}

impl Settings {
    fn parse() -> anyhow::Result<Self> {
        let mut settings = Settings {
            url: None,
            mtu: DEFAULT_MTU,
            tun_name: "doh0".to_string(),
            history: false,
            log_level: LogLevel::Info,
        };
        let mut args = env::args().skip(1);
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--url" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--url requires a value"))?;
                    settings.url = Some(value);
                }
                "--mtu" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--mtu requires a value"))?;
                    let mtu: u32 = value.parse().map_err(|_| anyhow::anyhow!("invalid mtu"))?;
                    settings.mtu = normalize_mtu(mtu);
                }
                "--tun" => {
                    settings.tun_name = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--tun requires a value"))?;
                }
                "--log-level" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--log-level requires a value"))?;
                    settings.log_level = LogLevel::parse(&value);
                }
                "--history" => settings.history = true,
                "--help" | "-h" => {
                    print_usage();
                    std::process::exit(0);
                }
                other => {
                    anyhow::bail!("unknown argument {other}");
                }
            }
        }
        Ok(settings)
    }
}

fn print_usage() {
    println!(
        "Usage: standalone [--url <https url>] [--mtu <bytes>] [--tun <name>] [--log-level <level>] [--history]\n\
         Without --url the built-in default server is used."
    );
}

fn install_log_sink(settings: &Settings) {
    let sink: LogSink = Arc::new(|level: LogLevel, _flags: BreadcrumbFlags, message: &str| {
        eprintln!("[{}] {}", level.as_str(), message);
    });
    let breadcrumbs = if settings.log_level == LogLevel::Debug {
        BreadcrumbFlags::ALL
    } else {
        BreadcrumbFlags::empty()
    };
    logger::install_sink(Some(sink), settings.log_level, breadcrumbs);
}

struct PrintTransactions;

impl TransactionListener for PrintTransactions {
    fn on_transaction(&self, transaction: &Transaction) {
        let cache = transaction
            .cache_status
            .map(|status| status.as_str())
            .unwrap_or("-");
        println!(
            "[dns] {} type={} status={} cache={} latency={}ms",
            transaction.name,
            transaction.qtype,
            transaction.status.as_str(),
            cache,
            transaction.latency_ms()
        );
    }
}

fn watch_stdin() {
    let mut stdin = io::stdin();
    let mut buf = [0u8; 256];
    loop {
        match stdin.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(_) => continue,
        }
    }
    SHUTDOWN.store(true, Ordering::Release);
}

#[cfg(target_os = "linux")]
mod platform {
    use super::SHUTDOWN;
    use std::fs::{File, OpenOptions};
    use std::io;
    use std::os::fd::AsRawFd;
    use std::sync::atomic::Ordering;

    const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
    const IFF_TUN: libc::c_short = 0x0001;
    const IFF_NO_PI: libc::c_short = 0x1000;

    #[repr(C)]
    struct IfReq {
        name: [libc::c_char; libc::IFNAMSIZ],
        flags: libc::c_short,
        _pad: [u8; 22],
    }

    /// Open (or attach to) the TUN interface `name` without packet info
    /// headers, so every read yields one bare IP packet.
    pub fn open_tun(name: &str) -> anyhow::Result<File> {
        if name.is_empty() || name.len() >= libc::IFNAMSIZ {
            anyhow::bail!("interface name must be 1..{} bytes", libc::IFNAMSIZ - 1);
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/net/tun")?;

        let mut request = IfReq {
            name: [0; libc::IFNAMSIZ],
            flags: IFF_TUN | IFF_NO_PI,
            _pad: [0; 22],
        };
        for (slot, byte) in request.name.iter_mut().zip(name.bytes()) {
            *slot = byte as libc::c_char;
        }
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &mut request as *mut IfReq) };
        if rc < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(file)
    }

    extern "C" fn on_interrupt(_signal: libc::c_int) {
        SHUTDOWN.store(true, Ordering::Release);
    }

    pub fn install_interrupt_handler() {
        let handler = on_interrupt as extern "C" fn(libc::c_int) as libc::sighandler_t;
        unsafe {
            libc::signal(libc::SIGINT, handler);
            libc::signal(libc::SIGTERM, handler);
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod platform {
    use std::fs::File;

    pub fn open_tun(_name: &str) -> anyhow::Result<File> {
        anyhow::bail!("the standalone runner only supports Linux TUN devices")
    }

    pub fn install_interrupt_handler() {}
}
