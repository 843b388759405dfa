//! 带重试的推送发送器
//!
//! `PushSender<P>` 对任意 [`PushProvider`] 实现同一套发送流程：
//!
//! 1. 校验请求，失败直接返回
//! 2. 计算实际重试上限
//! 3. 逐轮发送：构造消息 → 取共享客户端 → 整批发送 → 汇总结果。
//!    token 推送下一轮只重发上一轮失败的 token；topic / condition 无法缩小
//!    目标，按退避间隔整体重发
//! 4. 返回最后一轮是否仍有失败
//!
//! 统计口径：成功数每轮累加，失败数只记录不再重试的那一轮，
//! 重试过程中同一个 token 不会被重复计为失败。

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use push_shared::observability::metrics;
use push_shared::retry::RetryPolicy;
use tracing::{debug, error, info};

use crate::error::DispatchError;
use crate::feedback::FeedbackDispatcher;
use crate::log::{PushStatus, log_push};
use crate::notification::{Platform, PushNotification};
use crate::provider::{ClientHandle, PushProvider, SendOutcome};
use crate::stats::StatStore;

/// 通知发送器 trait，worker 按平台选择实现
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationSender: Send + Sync {
    /// 该发送器负责的平台
    fn platform(&self) -> Platform;

    /// 发送一条请求（含重试），返回最后一轮是否仍有失败
    async fn send(&self, notification: &mut PushNotification) -> bool;
}

/// 发送结果的副作用去向
#[derive(Clone)]
pub struct SenderContext {
    pub stats: Arc<StatStore>,
    /// 异步模式下接收失败记录，未配置回调地址时为 None
    pub feedback: Option<FeedbackDispatcher>,
    pub hide_token: bool,
}

impl SenderContext {
    pub fn new(stats: Arc<StatStore>) -> Self {
        Self {
            stats,
            feedback: None,
            hide_token: false,
        }
    }
}

pub struct PushSender<P: PushProvider> {
    provider: P,
    client: ClientHandle<P::Client>,
    /// `max_retries` 为平台全局重试上限，退避参数用于 topic / condition 重试
    retry: RetryPolicy,
    context: SenderContext,
}

impl<P: PushProvider> PushSender<P> {
    pub fn new(provider: P, retry: RetryPolicy, context: SenderContext) -> Self {
        Self {
            provider,
            client: ClientHandle::new(),
            retry,
            context,
        }
    }

    /// 注入外部持有的客户端句柄
    pub fn with_client(mut self, client: ClientHandle<P::Client>) -> Self {
        self.client = client;
        self
    }

    pub fn client_handle(&self) -> &ClientHandle<P::Client> {
        &self.client
    }

    /// 启动时预先初始化客户端
    pub async fn bootstrap(&self) -> Result<(), DispatchError> {
        self.client().await.map(|_| ())
    }

    async fn client(&self) -> Result<&P::Client, DispatchError> {
        self.client
            .get_or_connect(|| self.provider.connect())
            .await
    }

    /// 发送一条请求，返回最后一轮是否仍有失败
    ///
    /// token 推送在重试之间会把 `notification.tokens` 替换为上一轮失败的子集。
    pub async fn push(&self, notification: &mut PushNotification) -> bool {
        let platform = self.provider.platform();
        debug!(platform = %platform, "开始推送");

        if let Err(e) = notification.validate() {
            error!(platform = %platform, error = %e, "推送请求校验失败");
            return true;
        }

        let max_retry = notification.effective_max_retry(self.retry.max_retries);
        let policy = self.retry.with_max_retries(max_retry);
        let mut round: u32 = 0;
        // 上一轮失败但因等待重试尚未计入统计的寻址单元数
        let mut pending: u64 = 0;

        loop {
            let messages = self.provider.build_messages(notification);
            if messages.is_empty() {
                debug!(platform = %platform, round, "没有待发送的消息");
                return false;
            }
            let expected = messages.len();

            let client = match self.client().await {
                Ok(client) => client,
                Err(e) => {
                    error!(platform = %platform, error = %e, "推送客户端初始化失败");
                    return self.abort(pending);
                }
            };

            let started = Instant::now();
            let result = tokio::select! {
                biased;
                _ = notification.context.cancel.cancelled() => Err(DispatchError::Cancelled),
                result = self.provider.send_batch(client, messages) => result,
            };
            metrics::record_round_duration(platform.as_str(), started.elapsed().as_secs_f64());

            let outcomes = match result.and_then(|outcomes| {
                if outcomes.len() == expected {
                    Ok(outcomes)
                } else {
                    Err(DispatchError::Transport {
                        platform,
                        reason: format!(
                            "推送平台返回 {} 个结果，实际发送 {expected} 条消息",
                            outcomes.len()
                        ),
                    })
                }
            }) {
                Ok(outcomes) => outcomes,
                Err(e) => {
                    error!(platform = %platform, round, error = %e, "推送平台请求失败");
                    return self.abort(pending);
                }
            };

            let will_retry = policy.should_retry(round);
            let failed = self.fold_outcomes(notification, outcomes, !will_retry);
            if failed.is_empty() {
                return false;
            }
            if !will_retry {
                return true;
            }
            pending = failed.len() as u64;

            round += 1;
            if notification.is_topic() {
                let delay = policy.delay_for_attempt(round - 1);
                info!(platform = %platform, round, delay_ms = delay.as_millis() as u64, "topic 推送失败，退避后重试");
                tokio::select! {
                    biased;
                    _ = notification.context.cancel.cancelled() => {
                        error!(platform = %platform, "推送请求已取消");
                        return self.abort(pending);
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            } else {
                info!(platform = %platform, round, remaining = failed.len(), "重试失败的 token");
                notification.tokens = failed;
            }
        }
    }

    /// 重试中途放弃：上一轮尚未计入的失败补记到统计
    fn abort(&self, pending: u64) -> bool {
        self.context
            .stats
            .add_failure(self.provider.platform(), pending);
        true
    }

    /// 汇总一轮的发送结果，返回失败的寻址单元
    ///
    /// 失败回调只针对设备 token；topic / condition 的失败只进入同步日志。
    fn fold_outcomes(
        &self,
        notification: &PushNotification,
        outcomes: Vec<SendOutcome>,
        final_round: bool,
    ) -> Vec<String> {
        let platform = self.provider.platform();
        let is_topic = notification.is_topic();
        let mut succeeded: u64 = 0;
        let mut failed = Vec::new();

        for outcome in outcomes {
            match outcome.error {
                None => {
                    log_push(
                        PushStatus::Succeeded,
                        &outcome.target,
                        notification,
                        None,
                        self.context.hide_token,
                    );
                    succeeded += 1;
                }
                Some(reason) => {
                    let entry = log_push(
                        PushStatus::Failed,
                        &outcome.target,
                        notification,
                        Some(&reason),
                        self.context.hide_token,
                    );
                    if notification.context.sync {
                        notification.add_log(entry);
                    } else if let Some(feedback) = self.context.feedback.as_ref().filter(|_| !is_topic) {
                        feedback.dispatch(entry);
                    }
                    failed.push(outcome.target);
                }
            }
        }

        debug!(
            platform = %platform,
            success = succeeded,
            failure = failed.len(),
            "本轮推送完成"
        );
        self.context.stats.add_success(platform, succeeded);
        if final_round {
            self.context.stats.add_failure(platform, failed.len() as u64);
        }

        failed
    }
}

#[async_trait]
impl<P: PushProvider> NotificationSender for PushSender<P> {
    fn platform(&self) -> Platform {
        self.provider.platform()
    }

    async fn send(&self, notification: &mut PushNotification) -> bool {
        self.push(notification).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::PushLog;
    use crate::notification::Target;
    use crate::stats::StatsSnapshot;
    use tokio_util::sync::CancellationToken;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    type Script = Box<dyn Fn(usize, &str) -> Option<String> + Send + Sync>;

    /// 按脚本返回结果的推送平台：`script(round, target)` 返回错误描述即失败
    struct ScriptedProvider {
        platform: Platform,
        script: Script,
        connect_calls: Arc<AtomicUsize>,
        fail_connect: bool,
        /// 从该轮开始整批返回传输错误
        batch_error_from: Option<usize>,
        /// 少返回一个结果
        short_outcomes: bool,
        send_delay: Option<Duration>,
        /// 每轮实际发送的目标
        rounds: Arc<Mutex<Vec<Vec<String>>>>,
    }

    impl ScriptedProvider {
        fn new(
            platform: Platform,
            script: impl Fn(usize, &str) -> Option<String> + Send + Sync + 'static,
        ) -> Self {
            Self {
                platform,
                script: Box::new(script),
                connect_calls: Arc::new(AtomicUsize::new(0)),
                fail_connect: false,
                batch_error_from: None,
                short_outcomes: false,
                send_delay: None,
                rounds: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl PushProvider for ScriptedProvider {
        type Client = ();
        type Message = String;

        fn platform(&self) -> Platform {
            self.platform
        }

        async fn connect(&self) -> Result<(), DispatchError> {
            self.connect_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_connect {
                return Err(DispatchError::ClientInit {
                    platform: self.platform,
                    reason: "credentials rejected".to_string(),
                });
            }
            Ok(())
        }

        fn build_messages(&self, notification: &PushNotification) -> Vec<String> {
            match notification.target() {
                Target::Tokens(tokens) => tokens.to_vec(),
                Target::Topic(t) | Target::Condition(t) => vec![t.to_string()],
            }
        }

        async fn send_batch(
            &self,
            _client: &(),
            messages: Vec<String>,
        ) -> Result<Vec<SendOutcome>, DispatchError> {
            let round = {
                let mut rounds = self.rounds.lock();
                rounds.push(messages.clone());
                rounds.len() - 1
            };
            if let Some(delay) = self.send_delay {
                tokio::time::sleep(delay).await;
            }
            if self.batch_error_from.is_some_and(|from| round >= from) {
                return Err(DispatchError::Transport {
                    platform: self.platform,
                    reason: "connection reset".to_string(),
                });
            }
            let mut outcomes: Vec<SendOutcome> = messages
                .into_iter()
                .map(|target| match (self.script)(round, &target) {
                    None => SendOutcome::success(target),
                    Some(err) => SendOutcome::failure(target, err),
                })
                .collect();
            if self.short_outcomes {
                outcomes.pop();
            }
            Ok(outcomes)
        }
    }

    fn sender(provider: ScriptedProvider, max_retry: u32) -> (PushSender<ScriptedProvider>, Arc<StatStore>) {
        let stats = Arc::new(StatStore::new());
        let retry = RetryPolicy {
            max_retries: max_retry,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2.0,
        };
        let sender = PushSender::new(provider, retry, SenderContext::new(stats.clone()));
        (sender, stats)
    }

    fn always_fail(targets: &'static [&'static str]) -> impl Fn(usize, &str) -> Option<String> + Send + Sync {
        move |_, target| targets.iter().any(|t| *t == target).then(|| "Unavailable".to_string())
    }

    #[tokio::test]
    async fn test_no_retry_when_max_retry_is_zero() {
        let provider = ScriptedProvider::new(Platform::Android, always_fail(&["b"]));
        let rounds = provider.rounds.clone();
        let (sender, stats) = sender(provider, 0);

        let mut req = PushNotification::with_tokens(Platform::Android, ["a", "b", "c"]);
        assert!(sender.send(&mut req).await);

        assert_eq!(rounds.lock().len(), 1);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.android.push_success, 2);
        assert_eq!(snapshot.android.push_error, 1);
    }

    #[tokio::test]
    async fn test_persistent_failures_exhaust_retries() {
        let provider = ScriptedProvider::new(Platform::Android, always_fail(&["b", "d"]));
        let rounds = provider.rounds.clone();
        let (sender, stats) = sender(provider, 2);

        let mut req = PushNotification::with_tokens(Platform::Android, ["a", "b", "c", "d"]);
        assert!(sender.send(&mut req).await);

        let rounds = rounds.lock();
        assert_eq!(rounds.len(), 3);
        assert_eq!(rounds[0], vec!["a", "b", "c", "d"]);
        assert_eq!(rounds[1], vec!["b", "d"]);
        assert_eq!(rounds[2], vec!["b", "d"]);

        // 失败数只计最后一轮
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.android.push_success, 2);
        assert_eq!(snapshot.android.push_error, 2);
        assert_eq!(req.tokens, vec!["b", "d"]);
    }

    #[tokio::test]
    async fn test_retry_only_failed_subset() {
        // b 首轮失败，第二轮成功
        let provider = ScriptedProvider::new(Platform::Ios, |round, target| {
            (round == 0 && target == "b").then(|| "InternalServerError".to_string())
        });
        let rounds = provider.rounds.clone();
        let (sender, stats) = sender(provider, 2);

        let mut req = PushNotification::with_tokens(Platform::Ios, ["a", "b", "c"]);
        assert!(!sender.send(&mut req).await);

        let rounds = rounds.lock();
        assert_eq!(rounds.len(), 2);
        assert_eq!(rounds[1], vec!["b"]);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.ios.push_success, 3);
        assert_eq!(snapshot.ios.push_error, 0);
        assert_eq!(snapshot.android.push_success, 0);
    }

    #[tokio::test]
    async fn test_single_round_counts_exactly() {
        let provider = ScriptedProvider::new(Platform::Android, always_fail(&["b", "e"]));
        let (sender, stats) = sender(provider, 0);

        let mut req = PushNotification::with_tokens(Platform::Android, ["a", "b", "c", "d", "e"]);
        sender.send(&mut req).await;

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.android.push_success, 3);
        assert_eq!(snapshot.android.push_error, 2);
    }

    #[tokio::test]
    async fn test_topic_failure_retries_whole_topic() {
        let provider = ScriptedProvider::new(Platform::Android, always_fail(&["news"]));
        let rounds = provider.rounds.clone();
        let (sender, stats) = sender(provider, 2);

        let mut req = PushNotification::new(Platform::Android);
        req.topic = Some("news".to_string());
        assert!(sender.send(&mut req).await);

        let rounds = rounds.lock();
        assert_eq!(rounds.len(), 3);
        assert!(rounds.iter().all(|r| r == &vec!["news".to_string()]));

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.android.push_error, 1);
        assert_eq!(snapshot.android.push_success, 0);
    }

    #[tokio::test]
    async fn test_client_init_failure_is_not_retried() {
        let mut provider = ScriptedProvider::new(Platform::Ios, |_, _| None);
        provider.fail_connect = true;
        let connect_calls = provider.connect_calls.clone();
        let rounds = provider.rounds.clone();
        let (sender, stats) = sender(provider, 3);

        let mut req = PushNotification::with_tokens(Platform::Ios, ["a"]);
        assert!(sender.send(&mut req).await);

        assert_eq!(connect_calls.load(Ordering::SeqCst), 1);
        assert!(rounds.lock().is_empty());
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
        assert!(!sender.client_handle().is_initialized());

        // 客户端保持未初始化，下一次发送重新尝试
        sender.send(&mut req).await;
        assert_eq!(connect_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_client_is_initialized_once() {
        let provider = ScriptedProvider::new(Platform::Android, |_, _| None);
        let connect_calls = provider.connect_calls.clone();
        let (sender, _stats) = sender(provider, 0);

        sender.bootstrap().await.unwrap();
        for _ in 0..3 {
            let mut req = PushNotification::with_tokens(Platform::Android, ["a"]);
            assert!(!sender.send(&mut req).await);
        }
        assert_eq!(connect_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_batch_error_aborts_without_retry() {
        let mut provider = ScriptedProvider::new(Platform::Android, |_, _| None);
        provider.batch_error_from = Some(0);
        let rounds = provider.rounds.clone();
        let (sender, stats) = sender(provider, 3);

        let mut req = PushNotification::with_tokens(Platform::Android, ["a", "b"]);
        assert!(sender.send(&mut req).await);

        assert_eq!(rounds.lock().len(), 1);
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }

    #[tokio::test]
    async fn test_invalid_request_never_reaches_provider() {
        let provider = ScriptedProvider::new(Platform::Ios, |_, _| None);
        let connect_calls = provider.connect_calls.clone();
        let (sender, _stats) = sender(provider, 1);

        // iOS 不支持 topic
        let mut req = PushNotification::new(Platform::Ios);
        req.topic = Some("news".to_string());
        assert!(sender.send(&mut req).await);
        assert_eq!(connect_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_request_retry_lowers_global_limit() {
        let provider = ScriptedProvider::new(Platform::Android, always_fail(&["a"]));
        let rounds = provider.rounds.clone();
        let (sender, _stats) = sender(provider, 5);

        let mut req = PushNotification::with_tokens(Platform::Android, ["a"]);
        req.retry = Some(1);
        sender.send(&mut req).await;
        assert_eq!(rounds.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_sync_mode_collects_failures() {
        let provider = ScriptedProvider::new(Platform::Android, always_fail(&["b"]));
        let (sender, _stats) = sender(provider, 0);

        let log = PushLog::new();
        let mut req = PushNotification::with_tokens(Platform::Android, ["a", "b"]);
        req.context.sync = true;
        req.context.log = Some(log.clone());
        sender.send(&mut req).await;

        let entries = log.snapshot();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].token, "b");
        assert_eq!(entries[0].status, PushStatus::Failed);
        assert_eq!(entries[0].error.as_deref(), Some("Unavailable"));
    }

    #[tokio::test]
    async fn test_cancellation_aborts_in_flight_send() {
        let mut provider = ScriptedProvider::new(Platform::Android, |_, _| None);
        provider.send_delay = Some(Duration::from_secs(30));
        let (sender, stats) = sender(provider, 3);

        let mut req = PushNotification::with_tokens(Platform::Android, ["a"]);
        let cancel = req.context.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let started = Instant::now();
        assert!(sender.send(&mut req).await);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }

    #[tokio::test]
    async fn test_failures_counted_when_retry_round_hits_transport_error() {
        let mut provider = ScriptedProvider::new(Platform::Android, always_fail(&["b"]));
        provider.batch_error_from = Some(1);
        let rounds = provider.rounds.clone();
        let (sender, stats) = sender(provider, 2);

        let mut req = PushNotification::with_tokens(Platform::Android, ["a", "b", "c"]);
        assert!(sender.send(&mut req).await);

        assert_eq!(rounds.lock().len(), 2);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.android.push_success, 2);
        assert_eq!(snapshot.android.push_error, 1);
        assert_eq!(snapshot.android.push_success + snapshot.android.push_error, 3);
    }

    #[tokio::test]
    async fn test_failures_counted_when_cancelled_before_retry_round() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        // 首轮 b 失败，同时取消请求，第二轮不会真正发出
        let provider = ScriptedProvider::new(Platform::Android, move |round, target| {
            if round == 0 {
                trigger.cancel();
            }
            (target == "b").then(|| "Unavailable".to_string())
        });
        let rounds = provider.rounds.clone();
        let (sender, stats) = sender(provider, 2);

        let mut req = PushNotification::with_tokens(Platform::Android, ["a", "b", "c"]);
        req.context.cancel = cancel;
        assert!(sender.send(&mut req).await);

        assert_eq!(rounds.lock().len(), 1);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.android.push_success, 2);
        assert_eq!(snapshot.android.push_error, 1);
    }

    #[tokio::test]
    async fn test_topic_failure_counted_when_cancelled_during_backoff() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let provider = ScriptedProvider::new(Platform::Android, move |_, _| {
            trigger.cancel();
            Some("Unavailable".to_string())
        });
        let rounds = provider.rounds.clone();
        let stats = Arc::new(StatStore::new());
        let retry = RetryPolicy {
            max_retries: 3,
            initial_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(30),
            multiplier: 1.0,
        };
        let sender = PushSender::new(provider, retry, SenderContext::new(stats.clone()));

        let mut req = PushNotification::new(Platform::Android);
        req.topic = Some("news".to_string());
        req.context.cancel = cancel;

        let started = Instant::now();
        assert!(sender.send(&mut req).await);
        assert!(started.elapsed() < Duration::from_secs(5));

        assert_eq!(rounds.lock().len(), 1);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.android.push_success, 0);
        assert_eq!(snapshot.android.push_error, 1);
    }

    #[tokio::test]
    async fn test_outcome_count_mismatch_is_batch_error() {
        let mut provider = ScriptedProvider::new(Platform::Ios, |_, _| None);
        provider.short_outcomes = true;
        let rounds = provider.rounds.clone();
        let (sender, stats) = sender(provider, 3);

        let mut req = PushNotification::with_tokens(Platform::Ios, ["a", "b", "c"]);
        assert!(sender.send(&mut req).await);

        // 不重试，也不计入部分结果
        assert_eq!(rounds.lock().len(), 1);
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }

    #[tokio::test]
    async fn test_mock_sender() {
        let mut mock = MockNotificationSender::new();
        mock.expect_platform().return_const(Platform::Ios);
        mock.expect_send()
            .withf(|n: &PushNotification| n.tokens == vec!["a".to_string()])
            .times(1)
            .returning(|_| false);

        let mut req = PushNotification::with_tokens(Platform::Ios, ["a"]);
        assert_eq!(mock.platform(), Platform::Ios);
        assert!(!mock.send(&mut req).await);
    }
}
