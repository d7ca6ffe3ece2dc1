//! Server health checks. A probe sends the canary query to one server; a
//! race probes several at once and reports the first that answers.

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::dns::CANARY_QUERY;
use crate::doh::ServerDirectory;
use crate::logger::{self, BreadcrumbFlags};

pub trait Probe: Send + Sync {
    /// Resolves to true when `url` produced any HTTP response to the canary.
    /// `cancel` is advisory: a probe that has already sent may finish.
    fn probe(&self, url: String, cancel: CancellationToken) -> BoxFuture<'static, bool>;
}

pub struct ServerConnectionProbe {
    directory: Arc<ServerDirectory>,
}

impl ServerConnectionProbe {
    pub fn new(directory: Arc<ServerDirectory>) -> Self {
        Self { directory }
    }
}

impl Probe for ServerConnectionProbe {
    fn probe(&self, url: String, cancel: CancellationToken) -> BoxFuture<'static, bool> {
        let directory = Arc::clone(&self.directory);
        async move {
            let connection = match directory.connect(&url).await {
                Ok(connection) => connection,
                Err(error) => {
                    logger::breadcrumb(BreadcrumbFlags::PROBE, format!("{url}: {error}"));
                    return false;
                }
            };
            if cancel.is_cancelled() {
                return false;
            }
            match connection.perform_request(&CANARY_QUERY).await {
                Ok(response) => {
                    logger::breadcrumb(
                        BreadcrumbFlags::PROBE,
                        format!("{url}: HTTP {}", response.status),
                    );
                    true
                }
                Err(error) => {
                    logger::breadcrumb(BreadcrumbFlags::PROBE, format!("{url}: {error}"));
                    false
                }
            }
        }
        .boxed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaceResult {
    Winner(usize),
    AllFailed,
}

impl RaceResult {
    /// Index of the winning URL, or -1.
    pub fn index(self) -> i64 {
        match self {
            RaceResult::Winner(index) => index as i64,
            RaceResult::AllFailed => -1,
        }
    }
}

pub type RaceListener = Box<dyn FnOnce(RaceResult) + Send>;

/// A single-use race. The listener fires exactly once; results that arrive
/// after it has fired are ignored.
pub struct Race {
    total: usize,
    failures: AtomicUsize,
    listener: Mutex<Option<RaceListener>>,
    cancel: CancellationToken,
}

impl Race {
    pub fn start(
        runtime: &Handle,
        prober: Arc<dyn Probe>,
        urls: Vec<String>,
        listener: RaceListener,
    ) -> Arc<Race> {
        let race = Arc::new(Race {
            total: urls.len(),
            failures: AtomicUsize::new(0),
            listener: Mutex::new(Some(listener)),
            cancel: CancellationToken::new(),
        });
        if urls.is_empty() {
            race.finish(RaceResult::AllFailed);
            return race;
        }

        logger::breadcrumb(BreadcrumbFlags::PROBE, format!("racing {} servers", urls.len()));
        for (index, url) in urls.into_iter().enumerate() {
            let probe = prober.probe(url, race.cancel.clone());
            let race = Arc::clone(&race);
            runtime.spawn(async move {
                let success = probe.await;
                race.report(index, success);
            });
        }
        race
    }

    pub fn is_finished(&self) -> bool {
        self.listener.lock().is_none()
    }

    /// Stop the race without reporting a result.
    pub fn cancel(&self) {
        self.listener.lock().take();
        self.cancel.cancel();
    }

    fn report(&self, index: usize, success: bool) {
        if success {
            self.finish(RaceResult::Winner(index));
        } else if self.failures.fetch_add(1, Ordering::SeqCst) + 1 == self.total {
            self.finish(RaceResult::AllFailed);
        }
    }

    fn finish(&self, result: RaceResult) {
        let listener = self.listener.lock().take();
        if let Some(listener) = listener {
            self.cancel.cancel();
            logger::breadcrumb(BreadcrumbFlags::PROBE, format!("race finished: {result:?}"));
            listener(result);
        }
    }
}
