//! 推送队列与 worker 池
//!
//! 有界队列负责准入控制：队列满时 `submit` 等待空位，`try_submit` 直接返回
//! `QueueFull`，不会静默丢弃请求。固定数量的 worker 共享同一个接收端，
//! 按请求的平台选择发送器并执行完整的重试流程，完成后丢弃作业。

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use push_shared::observability::metrics;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::DispatchError;
use crate::notification::{Platform, PushNotification};
use crate::sender::NotificationSender;
use crate::stats::StatStore;

/// 队列中的作业
#[derive(Debug)]
pub struct PushJob {
    pub notification: PushNotification,
    /// 作业处理完毕（成功或重试耗尽）后触发，同步模式下由 HTTP 层等待
    pub done: Option<oneshot::Sender<()>>,
}

impl PushJob {
    pub fn new(notification: PushNotification) -> Self {
        Self {
            notification,
            done: None,
        }
    }

    /// 附带完成信号的作业
    pub fn with_done(notification: PushNotification) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                notification,
                done: Some(tx),
            },
            rx,
        )
    }
}

/// 队列与 worker 的运行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub queue_max: usize,
    pub queue_usage: usize,
    pub workers: usize,
    pub busy_workers: usize,
}

/// 推送队列的生产端，可克隆共享
#[derive(Clone)]
pub struct DispatchQueue {
    tx: mpsc::Sender<PushJob>,
    stats: Arc<StatStore>,
    workers: usize,
    busy: Arc<AtomicUsize>,
    shutdown: watch::Receiver<bool>,
}

impl DispatchQueue {
    /// 校验后入队，队列满时等待
    pub async fn submit(&self, notification: PushNotification) -> Result<(), DispatchError> {
        self.submit_job(PushJob::new(notification)).await
    }

    pub async fn submit_job(&self, job: PushJob) -> Result<(), DispatchError> {
        job.notification.validate()?;
        let count = job.notification.target_count() as u64;

        self.tx
            .send(job)
            .await
            .map_err(|_| DispatchError::QueueClosed)?;
        self.on_enqueued(count);
        Ok(())
    }

    /// 校验后入队，队列满时立即返回 `QueueFull`
    pub fn try_submit(&self, notification: PushNotification) -> Result<(), DispatchError> {
        self.try_submit_job(PushJob::new(notification))
    }

    pub fn try_submit_job(&self, job: PushJob) -> Result<(), DispatchError> {
        job.notification.validate()?;
        let count = job.notification.target_count() as u64;

        self.tx.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DispatchError::QueueFull {
                capacity: self.tx.max_capacity(),
            },
            mpsc::error::TrySendError::Closed(_) => DispatchError::QueueClosed,
        })?;
        self.on_enqueued(count);
        Ok(())
    }

    fn on_enqueued(&self, count: u64) {
        self.stats.add_total(count);
        metrics::set_queue_usage(self.usage());
    }

    fn usage(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn status(&self) -> QueueStatus {
        QueueStatus {
            queue_max: self.tx.max_capacity(),
            queue_usage: self.usage(),
            workers: self.workers,
            busy_workers: self.busy.load(Ordering::Relaxed),
        }
    }

    /// worker 池是否仍在运行
    pub fn is_running(&self) -> bool {
        !*self.shutdown.borrow() && !self.tx.is_closed()
    }
}

/// worker 池句柄，用于优雅停机
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
    // 池存活期间队列保持打开，即使没有 worker
    _receiver: Arc<Mutex<mpsc::Receiver<PushJob>>>,
}

impl WorkerPool {
    /// 通知所有 worker 停止，等待手上的作业处理完毕
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "推送 worker 异常退出");
            }
        }
        info!("推送 worker 已全部停止");
    }
}

/// 创建有界队列并启动 worker
pub fn init_workers(
    worker_num: usize,
    queue_num: usize,
    senders: HashMap<Platform, Arc<dyn NotificationSender>>,
    stats: Arc<StatStore>,
) -> (DispatchQueue, WorkerPool) {
    let (tx, rx) = mpsc::channel(queue_num.max(1));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let receiver = Arc::new(Mutex::new(rx));
    let senders = Arc::new(senders);
    let busy = Arc::new(AtomicUsize::new(0));

    let handles = (0..worker_num)
        .map(|worker_id| {
            tokio::spawn(run_worker(
                worker_id,
                receiver.clone(),
                senders.clone(),
                busy.clone(),
                shutdown_rx.clone(),
            ))
        })
        .collect();

    info!(worker_num, queue_num, "推送 worker 已启动");

    let queue = DispatchQueue {
        tx,
        stats,
        workers: worker_num,
        busy,
        shutdown: shutdown_rx,
    };
    let pool = WorkerPool {
        shutdown: shutdown_tx,
        handles,
        _receiver: receiver,
    };
    (queue, pool)
}

async fn run_worker(
    worker_id: usize,
    receiver: Arc<Mutex<mpsc::Receiver<PushJob>>>,
    senders: Arc<HashMap<Platform, Arc<dyn NotificationSender>>>,
    busy: Arc<AtomicUsize>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        let job = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            job = async {
                let mut rx = receiver.lock().await;
                let job = rx.recv().await;
                metrics::set_queue_usage(rx.len());
                job
            } => job,
        };

        let Some(job) = job else {
            debug!(worker_id, "推送队列已关闭");
            break;
        };

        busy.fetch_add(1, Ordering::Relaxed);
        process_job(worker_id, &senders, job).await;
        busy.fetch_sub(1, Ordering::Relaxed);
    }

    debug!(worker_id, "推送 worker 退出");
}

async fn process_job(
    worker_id: usize,
    senders: &HashMap<Platform, Arc<dyn NotificationSender>>,
    job: PushJob,
) {
    let PushJob {
        mut notification,
        done,
    } = job;
    let platform = notification.platform;

    match senders.get(&platform) {
        Some(sender) => {
            let failed = sender.send(&mut notification).await;
            debug!(worker_id, platform = %platform, failed, "推送作业完成");
        }
        None => {
            error!(worker_id, platform = %platform, "该平台未启用，丢弃推送作业");
        }
    }

    if let Some(done) = done {
        let _ = done.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sender::MockNotificationSender;

    fn mock_sender(platform: Platform, times: usize) -> Arc<dyn NotificationSender> {
        let mut mock = MockNotificationSender::new();
        mock.expect_platform().return_const(platform);
        mock.expect_send()
            .withf(move |n: &PushNotification| n.platform == platform)
            .times(times)
            .returning(|_| false);
        Arc::new(mock)
    }

    #[tokio::test]
    async fn test_jobs_routed_by_platform() {
        let stats = Arc::new(StatStore::new());
        let senders = HashMap::from([
            (Platform::Ios, mock_sender(Platform::Ios, 1)),
            (Platform::Android, mock_sender(Platform::Android, 2)),
        ]);
        let (queue, pool) = init_workers(2, 16, senders, stats.clone());

        let mut waits = Vec::new();
        for (platform, token) in [
            (Platform::Ios, "i1"),
            (Platform::Android, "a1"),
            (Platform::Android, "a2"),
        ] {
            let (job, done) = PushJob::with_done(PushNotification::with_tokens(platform, [token]));
            queue.submit_job(job).await.unwrap();
            waits.push(done);
        }
        for done in waits {
            done.await.unwrap();
        }

        assert_eq!(stats.snapshot().total_count, 3);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_total_counts_addressing_units() {
        let stats = Arc::new(StatStore::new());
        let (queue, _pool) = init_workers(0, 8, HashMap::new(), stats.clone());

        queue
            .try_submit(PushNotification::with_tokens(Platform::Android, ["a", "b", "c"]))
            .unwrap();
        let mut topic = PushNotification::new(Platform::Android);
        topic.topic = Some("news".to_string());
        queue.try_submit(topic).unwrap();

        assert_eq!(stats.snapshot().total_count, 4);
    }

    #[tokio::test]
    async fn test_invalid_request_is_rejected() {
        let stats = Arc::new(StatStore::new());
        let (queue, _pool) = init_workers(0, 8, HashMap::new(), stats.clone());

        let err = queue
            .submit(PushNotification::new(Platform::Ios))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Validation(_)));
        assert_eq!(queue.status().queue_usage, 0);
        assert_eq!(stats.snapshot().total_count, 0);
    }

    #[tokio::test]
    async fn test_backpressure_when_full() {
        let stats = Arc::new(StatStore::new());
        // 没有 worker 消费，容量为 1
        let (queue, _pool) = init_workers(0, 1, HashMap::new(), stats);

        let req = || PushNotification::with_tokens(Platform::Ios, ["a"]);
        queue.try_submit(req()).unwrap();

        let err = queue.try_submit(req()).unwrap_err();
        assert!(matches!(err, DispatchError::QueueFull { capacity: 1 }));

        // 阻塞式入队一直等待空位
        let mut blocked = tokio_test::task::spawn(queue.submit(req()));
        tokio_test::assert_pending!(blocked.poll());
        tokio_test::assert_pending!(blocked.poll());
        drop(blocked);

        let status = queue.status();
        assert_eq!(status.queue_max, 1);
        assert_eq!(status.queue_usage, 1);
    }

    #[tokio::test]
    async fn test_missing_sender_still_completes_job() {
        let stats = Arc::new(StatStore::new());
        let senders = HashMap::from([(Platform::Android, mock_sender(Platform::Android, 0))]);
        let (queue, pool) = init_workers(1, 4, senders, stats);

        let (job, done) = PushJob::with_done(PushNotification::with_tokens(Platform::Ios, ["a"]));
        queue.submit_job(job).await.unwrap();
        done.await.unwrap();

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_status_and_shutdown() {
        let stats = Arc::new(StatStore::new());
        let (queue, pool) = init_workers(3, 32, HashMap::new(), stats);

        let status = queue.status();
        assert_eq!(status.queue_max, 32);
        assert_eq!(status.workers, 3);
        assert_eq!(status.busy_workers, 0);
        assert!(queue.is_running());

        pool.shutdown().await;
        assert!(!queue.is_running());
    }
}
