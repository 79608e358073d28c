//! Mock providers shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use conductor::{CallContext, GenerateRequest, OrchestratorError, Provider, ProviderOutput};

#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    /// Succeed after `delay`.
    Succeed(Duration),
    /// Return an upstream 500.
    Fail,
    /// Reach the service but get a structured decline.
    Decline,
    /// Never answer within any sane deadline.
    Hang,
    Panic,
    /// Fail the first n calls, then succeed immediately.
    FailTimes(usize),
}

pub struct MockProvider {
    id: String,
    behavior: Behavior,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    healthy: AtomicBool,
    init_fails: bool,
    shutdowns: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockProvider {
    pub fn new(id: &str, behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            behavior,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            healthy: AtomicBool::new(true),
            init_fails: false,
            shutdowns: AtomicUsize::new(0),
        })
    }

    pub fn succeeding(id: &str) -> Arc<Self> {
        Self::new(id, Behavior::Succeed(Duration::ZERO))
    }

    pub fn failing(id: &str) -> Arc<Self> {
        Self::new(id, Behavior::Fail)
    }

    pub fn hanging(id: &str) -> Arc<Self> {
        Self::new(id, Behavior::Hang)
    }

    pub fn with_failing_init(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            behavior: Behavior::Succeed(Duration::ZERO),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            healthy: AtomicBool::new(true),
            init_fails: true,
            shutdowns: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    async fn init(&self) -> Result<(), OrchestratorError> {
        if self.init_fails {
            return Err(OrchestratorError::Config(format!("{}: missing API key", self.id)));
        }
        Ok(())
    }

    async fn generate(
        &self,
        request: &GenerateRequest,
        _ctx: CallContext,
    ) -> Result<ProviderOutput, OrchestratorError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        match self.behavior {
            Behavior::Succeed(delay) => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok(ProviderOutput::text(format!("{} says: {}", self.id, request.prompt)))
            }
            Behavior::Fail => Err(OrchestratorError::Upstream {
                provider: self.id.clone(),
                message: "500 Internal Server Error: stack trace at 10.0.0.7".to_string(),
                status: Some(500),
            }),
            Behavior::Decline => Err(OrchestratorError::Declined {
                provider: self.id.clone(),
                message: "content filtered".to_string(),
            }),
            Behavior::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(OrchestratorError::Other("woke from hang".to_string()))
            }
            Behavior::Panic => panic!("mock provider {} panicked", self.id),
            Behavior::FailTimes(n) => {
                if call < n {
                    Err(OrchestratorError::RateLimited {
                        provider: self.id.clone(),
                    })
                } else {
                    Ok(ProviderOutput::text("recovered"))
                }
            }
        }
    }

    async fn shutdown(&self) -> Result<(), OrchestratorError> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
