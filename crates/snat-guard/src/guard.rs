//! SNAT 가드 오케스트레이터 -- 이벤트 수신/재조정 루프 관리
//!
//! [`SnatGuard`]는 core의 [`Pipeline`] trait을 구현하여
//! `dfm-daemon`에서 start/stop/health_check 생명주기로 관리됩니다.
//!
//! # 내부 아키텍처
//! ```text
//! EventSource ──subscription──> SnatGuard 루프
//!                                   |
//!                          Reconciler.handle()
//!                                   |
//!                   RuleStore / AddressResolver
//! ```
//!
//! 루프는 이벤트를 하나씩, 도착 순서대로 처리합니다. 취소 토큰은 이벤트 사이에서만
//! 확인되므로 진행 중인 룰 테이블 연산은 끝까지 실행됩니다.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use metrics::counter;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use dfm_core::error::{DfmError, PipelineError};
use dfm_core::metrics as m;
use dfm_core::pipeline::{HealthStatus, Pipeline};

use crate::config::SnatGuardConfig;
use crate::error::SnatGuardError;
use crate::event::{ContainerEvent, ContainerEventKind};
use crate::reconciler::{Outcome, Reconciler};
use crate::resolver::AddressResolver;
use crate::source::{EventSource, EventSubscription};
use crate::store::RuleStore;

/// 루프 종료 대기 시간. 초과하면 태스크를 abort 합니다.
const STOP_TIMEOUT: Duration = Duration::from_secs(15);

/// 가드 실행 상태
#[derive(Debug, Clone, PartialEq, Eq)]
enum GuardState {
    /// 초기화됨, 아직 시작하지 않음
    Initialized,
    /// 실행 중
    Running,
    /// 정지됨
    Stopped,
}

/// 루프와 공유하는 카운터
#[derive(Debug, Default)]
struct GuardCounters {
    events_processed: AtomicU64,
    operation_failures: AtomicU64,
    feed_closed: AtomicBool,
}

/// SNAT 가드 -- 컨테이너 이벤트를 받아 SNAT 룰을 재조정합니다.
///
/// # 사용 예시
/// ```ignore
/// use dfm_snat_guard::{SnatGuardBuilder, IptablesRuleStore, DockerAddressResolver, DockerEventSource};
///
/// let mut guard = SnatGuardBuilder::new()
///     .config(config)
///     .store(store)
///     .resolver(resolver)
///     .event_source(source)
///     .build()?;
///
/// guard.start().await?;
/// ```
pub struct SnatGuard<S: RuleStore, R: AddressResolver, E: EventSource> {
    /// 가드 설정
    config: SnatGuardConfig,
    /// 현재 상태
    state: GuardState,
    /// 재조정기 (루프 태스크와 공유)
    reconciler: Arc<Mutex<Reconciler<S, R>>>,
    /// 헬스 체크용 resolver (재조정기 락 없이 사용)
    resolver: Arc<R>,
    /// 이벤트 소스
    source: E,
    /// 루프 취소 토큰 (start마다 새로 생성)
    cancel: CancellationToken,
    /// 루프 태스크 핸들
    task: Option<JoinHandle<()>>,
    /// 카운터
    counters: Arc<GuardCounters>,
}

impl<S: RuleStore, R: AddressResolver, E: EventSource> SnatGuard<S, R, E> {
    /// 현재 상태명을 반환합니다.
    pub fn state_name(&self) -> &str {
        match self.state {
            GuardState::Initialized => "initialized",
            GuardState::Running => "running",
            GuardState::Stopped => "stopped",
        }
    }

    /// 처리된 이벤트 수를 반환합니다.
    pub fn events_processed(&self) -> u64 {
        self.counters.events_processed.load(Ordering::Relaxed)
    }

    /// 실패한 이벤트 처리 수를 반환합니다.
    pub fn operation_failures(&self) -> u64 {
        self.counters.operation_failures.load(Ordering::Relaxed)
    }

    /// 이벤트 피드가 끊겨 루프가 끝났는지 여부
    pub fn feed_closed(&self) -> bool {
        self.counters.feed_closed.load(Ordering::Relaxed)
    }

    pub fn config(&self) -> &SnatGuardConfig {
        &self.config
    }

    /// 재조정기에 대한 Arc 참조를 반환합니다.
    pub fn reconciler(&self) -> Arc<Mutex<Reconciler<S, R>>> {
        Arc::clone(&self.reconciler)
    }

    /// 루프 태스크가 끝날 때까지 기다립니다.
    ///
    /// 피드가 닫히거나 실패하면 반환됩니다. 실행 중이 아니면 즉시 반환됩니다.
    pub async fn closed(&mut self) {
        if let Some(task) = self.task.as_mut() {
            if let Err(e) = task.await {
                error!(error = %e, "snat guard loop panicked");
            }
            self.task = None;
        }
    }
}

impl<S: RuleStore, R: AddressResolver, E: EventSource> Pipeline for SnatGuard<S, R, E> {
    async fn start(&mut self) -> Result<(), DfmError> {
        if self.state == GuardState::Running {
            return Err(PipelineError::AlreadyRunning.into());
        }

        info!(
            name_pattern = %self.config.name_pattern,
            bridge = %self.config.bridge,
            "starting snat guard"
        );

        // 1. 이벤트 구독. 동기화 중에 발생한 이벤트는 구독 채널에 쌓인다
        self.cancel = CancellationToken::new();
        let subscription = self.source.subscribe(self.cancel.clone())?;

        // 2. 전체 동기화
        if self.config.sync_on_start {
            match self.reconciler.lock().await.sync().await {
                Ok(report) => info!(
                    pruned = report.pruned,
                    added = report.added,
                    replaced = report.replaced,
                    unchanged = report.unchanged,
                    unresolved = report.unresolved,
                    "initial rule sync complete"
                ),
                Err(e) => {
                    counter!(m::SNAT_OPERATION_FAILURES_TOTAL, m::LABEL_OP => "sync").increment(1);
                    warn!(error = %e, "initial rule sync failed, continuing with event loop");
                }
            }
        }

        // 3. 처리 루프 스폰
        self.counters.feed_closed.store(false, Ordering::Relaxed);
        let task = tokio::spawn(run_loop(
            subscription,
            Arc::clone(&self.reconciler),
            self.cancel.clone(),
            Arc::clone(&self.counters),
        ));

        self.task = Some(task);
        self.state = GuardState::Running;
        info!("snat guard started");
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), DfmError> {
        if self.state != GuardState::Running {
            return Err(PipelineError::NotRunning.into());
        }

        info!("stopping snat guard");
        self.cancel.cancel();

        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(STOP_TIMEOUT, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "snat guard loop panicked"),
                Err(_) => {
                    warn!(
                        timeout_secs = STOP_TIMEOUT.as_secs(),
                        "snat guard loop did not stop in time, aborting"
                    );
                    task.abort();
                }
            }
        }

        self.state = GuardState::Stopped;
        info!("snat guard stopped");
        Ok(())
    }

    async fn health_check(&self) -> HealthStatus {
        match self.state {
            GuardState::Running => {
                if self.feed_closed() {
                    return HealthStatus::Unhealthy("container event feed closed".to_owned());
                }
                if self.resolver.ping().await.is_ok() {
                    HealthStatus::Healthy
                } else {
                    HealthStatus::Degraded("docker daemon not reachable".to_owned())
                }
            }
            GuardState::Initialized => HealthStatus::Unhealthy("not started".to_owned()),
            GuardState::Stopped => HealthStatus::Unhealthy("stopped".to_owned()),
        }
    }
}

async fn run_loop<S: RuleStore, R: AddressResolver>(
    mut subscription: EventSubscription,
    reconciler: Arc<Mutex<Reconciler<S, R>>>,
    cancel: CancellationToken,
    counters: Arc<GuardCounters>,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                info!("snat guard loop cancelled");
                break;
            }
            item = subscription.next() => match item {
                Some(Ok(event)) => {
                    let mut reconciler = reconciler.lock().await;
                    process(&mut reconciler, &event, &counters).await;
                }
                Some(Err(e)) => {
                    error!(error = %e, "container event feed failed, stopping loop");
                    counters.feed_closed.store(true, Ordering::Relaxed);
                    break;
                }
                None => {
                    if !cancel.is_cancelled() {
                        error!("container event feed closed, stopping loop");
                        counters.feed_closed.store(true, Ordering::Relaxed);
                    }
                    break;
                }
            }
        }
    }
}

async fn process<S: RuleStore, R: AddressResolver>(
    reconciler: &mut Reconciler<S, R>,
    event: &ContainerEvent,
    counters: &GuardCounters,
) {
    counters.events_processed.fetch_add(1, Ordering::Relaxed);
    counter!(m::SNAT_EVENTS_PROCESSED_TOTAL, m::LABEL_EVENT_KIND => event.kind.label())
        .increment(1);

    match reconciler.handle(event).await {
        Ok(Outcome::Ignored) => {}
        Ok(outcome) => debug!(container = %event.name, ?outcome, "container event handled"),
        Err(e @ SnatGuardError::AddressResolution { .. }) => {
            warn!(container = %event.name, error = %e, "cannot build snat rule");
        }
        Err(e) => {
            counters.operation_failures.fetch_add(1, Ordering::Relaxed);
            let op = match event.kind {
                ContainerEventKind::Start => "add",
                ContainerEventKind::Die => "remove",
                ContainerEventKind::Other(_) => "other",
            };
            counter!(m::SNAT_OPERATION_FAILURES_TOTAL, m::LABEL_OP => op).increment(1);
            if e.is_store_failure() {
                error!(
                    container = %event.name,
                    kind = %event.kind,
                    error = %e,
                    "rule table operation failed, event skipped"
                );
            } else {
                warn!(
                    container = %event.name,
                    kind = %event.kind,
                    error = %e,
                    "failed to handle container event"
                );
            }
        }
    }
}

/// SNAT 가드 빌더
pub struct SnatGuardBuilder<S: RuleStore, R: AddressResolver, E: EventSource> {
    config: SnatGuardConfig,
    store: Option<S>,
    resolver: Option<R>,
    source: Option<E>,
}

impl<S: RuleStore, R: AddressResolver, E: EventSource> SnatGuardBuilder<S, R, E> {
    /// 새 빌더를 생성합니다.
    pub fn new() -> Self {
        Self {
            config: SnatGuardConfig::default(),
            store: None,
            resolver: None,
            source: None,
        }
    }

    /// 가드 설정을 지정합니다.
    pub fn config(mut self, config: SnatGuardConfig) -> Self {
        self.config = config;
        self
    }

    /// 룰 저장소를 설정합니다.
    pub fn store(mut self, store: S) -> Self {
        self.store = Some(store);
        self
    }

    /// 주소 resolver를 설정합니다.
    pub fn resolver(mut self, resolver: R) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// 이벤트 소스를 설정합니다.
    pub fn event_source(mut self, source: E) -> Self {
        self.source = Some(source);
        self
    }

    /// 가드를 빌드합니다.
    pub fn build(self) -> Result<SnatGuard<S, R, E>, SnatGuardError> {
        self.config.validate()?;

        let missing = |field: &str| SnatGuardError::Config {
            field: field.to_owned(),
            reason: format!("{field} must be provided"),
        };
        let store = self.store.ok_or_else(|| missing("store"))?;
        let resolver = self.resolver.ok_or_else(|| missing("resolver"))?;
        let source = self.source.ok_or_else(|| missing("event_source"))?;

        let reconciler = Reconciler::new(store, resolver, &self.config)?;
        let resolver = reconciler.shared_resolver();

        Ok(SnatGuard {
            config: self.config,
            state: GuardState::Initialized,
            reconciler: Arc::new(Mutex::new(reconciler)),
            resolver,
            source,
            cancel: CancellationToken::new(),
            task: None,
            counters: Arc::new(GuardCounters::default()),
        })
    }
}

impl<S: RuleStore, R: AddressResolver, E: EventSource> Default for SnatGuardBuilder<S, R, E> {
    fn default() -> Self {
        Self::new()
    }
}
