use std::{sync::Arc, time::Duration};

use chrono::TimeDelta;
use pretty_assertions::assert_eq;
use smsgate::{
    Gateway, LockError, LockFile, RunOutcome, RunnerConfig, RunnerControl, RunnerError, Worker,
    WorkerRunner,
};
use smsgate_common::{Clock, ManualClock, Signal};
use smsgate_control::{
    CommandHandler, ModemCommand, QueueCommand, Request, RequestCommand, ResponseData,
    ResponsePayload,
};
use smsgate_dispatch::{IncomingSms, ScriptedDispatcher, ScriptedReceiver, ScriptedStep};
use smsgate_queue::{InboxConfig, InboxPoller, NotificationTrigger, QueueConfig, QueueEngine};
use smsgate_store::{
    MessageId, MessageStatus, NewMessage, NewModem, NewNotification, NotificationKind,
    NotificationPriority, StoreError, StoreHandles, TestStore,
};
use tempfile::TempDir;
use tokio::sync::broadcast;

struct Harness {
    _dir: TempDir,
    store: TestStore,
    handles: StoreHandles,
    clock: ManualClock,
    dispatcher: ScriptedDispatcher,
    config: RunnerConfig,
}

impl Harness {
    fn new(dispatcher: ScriptedDispatcher) -> Self {
        let dir = TempDir::new().expect("tempdir");
        let store = TestStore::new();
        let config = RunnerConfig {
            lock_path: dir.path().join("worker.lock"),
            cycle_interval_secs: 3600,
            shutdown_grace_secs: 0,
            ..RunnerConfig::default()
        };
        Self {
            _dir: dir,
            handles: StoreHandles::from_backend(store.clone()),
            store,
            clock: ManualClock::default(),
            dispatcher,
            config,
        }
    }

    fn runner(&self) -> WorkerRunner {
        let clock: Arc<dyn Clock> = Arc::new(self.clock.clone());
        let engine = QueueEngine::new(
            self.handles.messages.clone(),
            self.handles.modems.clone(),
            NotificationTrigger::new(self.handles.notifications.clone(), clock.clone()),
            Arc::new(self.dispatcher.clone()),
            clock.clone(),
            QueueConfig::default(),
        )
        .expect("engine");
        WorkerRunner::new(
            engine,
            clock,
            self.config.clone(),
            Arc::new(RunnerControl::default()),
        )
    }

    fn inbox(&self, receiver: &ScriptedReceiver) -> InboxPoller {
        InboxPoller::new(
            self.handles.inbox.clone(),
            self.handles.modems.clone(),
            Arc::new(receiver.clone()),
            Arc::new(self.clock.clone()),
        )
    }

    async fn wait_for_lock(&self) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !self.config.lock_path.exists() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("lock taken");
    }

    async fn modem(&self) {
        self.handles
            .modems
            .register(NewModem::new("usb0", "/dev/ttyUSB0", 1), self.clock.now())
            .await
            .expect("register");
    }

    async fn submit(&self) -> MessageId {
        self.handles
            .messages
            .insert(NewMessage::new("+33612345678", "hello", 1), self.clock.now())
            .await
            .expect("insert")
            .id
    }

    async fn status(&self, id: MessageId) -> MessageStatus {
        self.handles.messages.get(id).await.expect("get").status
    }

    async fn wait_for_status(&self, id: MessageId, expected: MessageStatus) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.status(id).await != expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("message reached expected status");
    }

    async fn wait_for_calls(&self, expected: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.dispatcher.call_count() < expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("dispatcher called");
    }
}

#[tokio::test]
async fn once_sends_and_releases_the_lock() {
    let harness = Harness::new(ScriptedDispatcher::new());
    harness.modem().await;
    let id = harness.submit().await;

    let (_tx, rx) = broadcast::channel(1);
    let outcome = harness.runner().run_once(rx).await.expect("run");

    let RunOutcome::Completed(report) = outcome else {
        panic!("expected a completed cycle, got {outcome:?}");
    };
    assert_eq!(report.sent, 1);
    assert_eq!(harness.status(id).await, MessageStatus::Sent);
    assert!(!harness.config.lock_path.exists());
}

#[tokio::test]
async fn once_does_nothing_while_another_worker_holds_the_lock() {
    let harness = Harness::new(ScriptedDispatcher::new());
    harness.modem().await;
    let id = harness.submit().await;

    let _held = LockFile::acquire(&harness.config.lock_path, harness.config.lock_grace())
        .expect("acquire")
        .expect("free lock");

    let (_tx, rx) = broadcast::channel(1);
    let outcome = harness.runner().run_once(rx).await.expect("run");

    assert_eq!(outcome, RunOutcome::LockHeld);
    assert_eq!(harness.dispatcher.call_count(), 0);
    assert_eq!(harness.status(id).await, MessageStatus::Pending);
}

#[tokio::test]
async fn store_outage_fails_the_run_and_still_releases_the_lock() {
    let harness = Harness::new(ScriptedDispatcher::new());
    harness.store.set_offline(true);

    let (_tx, rx) = broadcast::channel(1);
    let err = harness.runner().run_once(rx).await.expect_err("outage");

    assert!(matches!(err, RunnerError::Cycle(_)));
    assert!(!harness.config.lock_path.exists());
}

#[tokio::test]
async fn serve_runs_on_request_and_stops_on_shutdown() {
    let harness = Harness::new(ScriptedDispatcher::new());
    harness.modem().await;

    let mut runner = harness.runner();
    let control = runner.control();
    let (tx, rx) = broadcast::channel(1);
    let task = tokio::spawn(async move { runner.serve(rx).await });

    let id = harness.submit().await;
    control.wake();
    harness.wait_for_status(id, MessageStatus::Sent).await;
    assert!(harness.config.lock_path.exists());

    tx.send(Signal::Shutdown).expect("shutdown");
    let outcome = task.await.expect("join").expect("serve");

    let RunOutcome::Stopped { cycles, abandoned } = outcome else {
        panic!("expected a stop, got {outcome:?}");
    };
    assert!(cycles >= 1);
    assert!(!abandoned);
    assert!(!harness.config.lock_path.exists());
}

#[tokio::test]
async fn frozen_worker_waits_for_unfreeze() {
    let harness = Harness::new(ScriptedDispatcher::new());
    harness.modem().await;
    let id = harness.submit().await;

    let mut runner = harness.runner();
    let control = runner.control();
    control.freeze();
    let (tx, rx) = broadcast::channel(1);
    let task = tokio::spawn(async move { runner.serve(rx).await });

    control.wake();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.dispatcher.call_count(), 0);
    assert_eq!(harness.status(id).await, MessageStatus::Pending);

    control.unfreeze();
    control.wake();
    harness.wait_for_status(id, MessageStatus::Sent).await;

    tx.send(Signal::Shutdown).expect("shutdown");
    task.await.expect("join").expect("serve");
}

#[tokio::test]
async fn frozen_worker_keeps_its_lock_past_the_grace_period() {
    let mut harness = Harness::new(ScriptedDispatcher::new());
    harness.config.lock_grace_secs = 1;

    let mut runner = harness.runner();
    runner.control().freeze();
    let (tx, rx) = broadcast::channel(1);
    let task = tokio::spawn(async move { runner.serve(rx).await });

    harness.wait_for_lock().await;
    tokio::time::sleep(Duration::from_millis(2500)).await;

    let grace = harness.config.lock_grace();
    assert!(
        LockFile::acquire(&harness.config.lock_path, grace)
            .expect("acquire")
            .is_none()
    );

    tx.send(Signal::Shutdown).expect("shutdown");
    task.await.expect("join").expect("serve");
    assert!(!harness.config.lock_path.exists());
}

#[tokio::test]
async fn worker_stops_when_its_lock_is_taken_over() {
    let mut harness = Harness::new(ScriptedDispatcher::new());
    harness.config.lock_grace_secs = 1;

    let mut runner = harness.runner();
    let control = runner.control();
    let (_tx, rx) = broadcast::channel(1);
    let task = tokio::spawn(async move { runner.serve(rx).await });

    harness.wait_for_lock().await;
    std::fs::write(&harness.config.lock_path, "99999\n").expect("overwrite lock");
    tokio::time::sleep(Duration::from_secs(1)).await;
    control.wake();

    let err = task.await.expect("join").expect_err("lock lost");
    assert!(matches!(err, RunnerError::Lock(LockError::Lost { .. })));
    assert_eq!(
        std::fs::read_to_string(&harness.config.lock_path).expect("read lock"),
        "99999\n"
    );
}

#[tokio::test]
async fn incoming_sms_are_read_after_the_cycle_and_purged_later() {
    let harness = Harness::new(ScriptedDispatcher::new());
    harness.modem().await;
    let receiver =
        ScriptedReceiver::new().then_receive(vec![IncomingSms::new("+33600000001", "STOP")]);

    let (_tx, rx) = broadcast::channel(1);
    harness
        .runner()
        .with_inbox(harness.inbox(&receiver), InboxConfig::default())
        .run_once(rx)
        .await
        .expect("run");

    assert_eq!(receiver.polled(), vec!["/dev/ttyUSB0"]);
    let inbox = harness.handles.inbox.list_received(None, 10).await.expect("list");
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].body, "STOP");

    harness.clock.advance(TimeDelta::days(31));
    let (_tx, rx) = broadcast::channel(1);
    harness
        .runner()
        .with_inbox(harness.inbox(&receiver), InboxConfig::default())
        .run_once(rx)
        .await
        .expect("run");

    let inbox = harness.handles.inbox.list_received(None, 10).await.expect("list");
    assert!(inbox.is_empty());
}

#[tokio::test]
async fn abandoned_cycle_is_recovered_by_the_next_run() {
    let harness = Harness::new(
        ScriptedDispatcher::new().then(ScriptedStep::Delay(
            Duration::from_secs(3600),
            Box::new(ScriptedStep::Send),
        )),
    );
    harness.modem().await;
    let id = harness.submit().await;

    let mut runner = harness.runner();
    let (tx, rx) = broadcast::channel(1);
    let task = tokio::spawn(async move { runner.serve(rx).await });

    harness.wait_for_calls(1).await;
    tx.send(Signal::Shutdown).expect("shutdown");
    let outcome = task.await.expect("join").expect("serve");

    assert_eq!(
        outcome,
        RunOutcome::Stopped {
            cycles: 0,
            abandoned: true
        }
    );
    assert_eq!(harness.status(id).await, MessageStatus::Processing);
    assert!(!harness.config.lock_path.exists());

    harness.clock.advance(TimeDelta::minutes(11));
    let (_tx, rx) = broadcast::channel(1);
    let RunOutcome::Completed(report) = harness.runner().run_once(rx).await.expect("run") else {
        panic!("expected a completed cycle");
    };
    assert_eq!(report.reclaimed, 1);
    assert_eq!(report.sent, 1);
    assert_eq!(harness.status(id).await, MessageStatus::Sent);
}

#[tokio::test]
async fn old_processed_notifications_are_purged() {
    let harness = Harness::new(ScriptedDispatcher::new());
    let notification = harness
        .handles
        .notifications
        .create(
            NewNotification {
                kind: NotificationKind::QueueBlocked,
                title: "Queue blocked".into(),
                message: "101 messages pending".into(),
                priority: NotificationPriority::Medium,
                data: serde_json::json!({ "pending": 101 }),
            },
            harness.clock.now(),
        )
        .await
        .expect("create");
    harness
        .handles
        .notifications
        .mark_processed(notification.id, harness.clock.now())
        .await
        .expect("processed");

    harness.clock.advance(TimeDelta::days(31));
    let (_tx, rx) = broadcast::channel(1);
    harness.runner().run_once(rx).await.expect("run");

    let err = harness
        .handles
        .notifications
        .get(notification.id)
        .await
        .expect_err("purged");
    assert!(matches!(err, StoreError::NotificationNotFound(_)));
}

#[tokio::test]
async fn assembled_worker_delivers_through_the_control_surface() {
    let dir = TempDir::new().expect("tempdir");
    let gateway = Gateway::from_ron(&format!(
        r#"(
            store: Memory,
            dispatcher: DryRun,
            runner: (lock_path: "{}"),
            control: (socket_path: "{}"),
        )"#,
        dir.path().join("worker.lock").display(),
        dir.path().join("smsgate.sock").display(),
    ))
    .expect("config");

    let mut worker = Worker::assemble(gateway, Arc::new(ManualClock::default()))
        .await
        .expect("assemble");

    let handle = |command| {
        let handler = worker.handler.clone();
        async move {
            handler
                .handle_request(Request::new(command))
                .await
                .expect("request")
        }
    };

    handle(RequestCommand::Modem(ModemCommand::Add {
        name: "usb0".into(),
        device_path: "/dev/ttyUSB0".into(),
        priority: 1,
    }))
    .await;
    let enqueued = handle(RequestCommand::Queue(QueueCommand::Enqueue {
        recipient: "+33612345678".into(),
        body: "hello".into(),
        priority: 1,
        scheduled_at: None,
        submitter: Some("ops".into()),
    }))
    .await;
    let ResponsePayload::Data(data) = enqueued.payload else {
        panic!("expected data");
    };
    assert!(matches!(*data, ResponseData::Enqueued(_)));

    let (_tx, rx) = broadcast::channel(1);
    let RunOutcome::Completed(report) = worker.runner.run_once(rx).await.expect("run") else {
        panic!("expected a completed cycle");
    };
    assert_eq!(report.sent, 1);

    let stats = handle(RequestCommand::Queue(QueueCommand::Stats)).await;
    let ResponsePayload::Data(data) = stats.payload else {
        panic!("expected data");
    };
    let ResponseData::QueueStats(stats) = *data else {
        panic!("expected stats");
    };
    assert_eq!(stats.sent, 1);
    assert_eq!(stats.total(), 1);
}
