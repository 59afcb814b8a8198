use std::sync::Arc;
use std::time::Duration;

use inferlink_protocol::{
    ChatMessage, ClientAction, ClientEvent, DEFAULT_SYSTEM_PROMPT, GroupInfos, GroupStatus,
    Interaction, InteractionStatus, Role, StatusType, WorkerCommand, WorkerEvent,
};
use libinferlink::{BrokerConfig, BrokerError, ClientSession, ConnectionManager, Group, WorkerSession};
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

struct TestClient {
    session: Arc<ClientSession>,
    rx: mpsc::Receiver<ClientEvent>,
}

impl TestClient {
    async fn connect(manager: &Arc<ConnectionManager>) -> Self {
        let (tx, rx) = mpsc::channel(256);
        let session = manager.register_client(tx).await;
        Self { session, rx }
    }

    async fn act(&self, action: ClientAction) -> Result<(), BrokerError> {
        self.session.handle(action).await
    }

    async fn group(&self) -> Arc<Group> {
        self.session.group().await.expect("client has no group")
    }

    /// Drain events until one matches.
    async fn expect(&mut self, mut pred: impl FnMut(&ClientEvent) -> bool) -> ClientEvent {
        timeout(WAIT, async {
            loop {
                let event = self.rx.recv().await.expect("client channel closed");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for client event")
    }

    async fn interaction(&mut self, status: InteractionStatus) -> Interaction {
        match self
            .expect(|e| matches!(e, ClientEvent::Interaction(i) if i.status == status))
            .await
        {
            ClientEvent::Interaction(interaction) => interaction,
            other => panic!("unexpected event {other:?}"),
        }
    }

    async fn infos(&mut self, mut pred: impl FnMut(&GroupInfos) -> bool) -> GroupInfos {
        match self
            .expect(|e| matches!(e, ClientEvent::GroupInfos(infos) if pred(infos)))
            .await
        {
            ClientEvent::GroupInfos(infos) => infos,
            other => panic!("unexpected event {other:?}"),
        }
    }

    fn try_next_interaction(&mut self) -> Option<Interaction> {
        while let Ok(event) = self.rx.try_recv() {
            if let ClientEvent::Interaction(interaction) = event {
                return Some(interaction);
            }
        }
        None
    }
}

struct TestWorker {
    session: Arc<WorkerSession>,
    rx: mpsc::Receiver<WorkerCommand>,
}

impl TestWorker {
    async fn connect(manager: &Arc<ConnectionManager>) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let session = manager.register_worker(tx).await;
        Self { session, rx }
    }

    async fn command(&mut self) -> WorkerCommand {
        timeout(WAIT, self.rx.recv())
            .await
            .expect("timed out waiting for worker command")
            .expect("worker channel closed")
    }

    async fn start_job(&mut self) -> Vec<ChatMessage> {
        match self.command().await {
            WorkerCommand::StartJob { messages } => messages,
            other => panic!("expected start_job, got {other:?}"),
        }
    }

    async fn emit(&self, event: WorkerEvent) {
        self.session.handle_event(event).await;
    }

    async fn reply(&self, chunks: &[&str]) {
        for chunk in chunks {
            self.emit(WorkerEvent::Chunk {
                text: chunk.to_string(),
            })
            .await;
        }
        self.emit(WorkerEvent::EndJob).await;
    }
}

fn manager() -> Arc<ConnectionManager> {
    ConnectionManager::new(BrokerConfig::default())
}

async fn client_in_new_group(manager: &Arc<ConnectionManager>, title: &str) -> TestClient {
    let mut client = TestClient::connect(manager).await;
    client
        .act(ClientAction::CreateGroup {
            title: Some(title.to_string()),
        })
        .await
        .unwrap();
    client.infos(|i| i.credential.title == title).await;
    client
}

fn prompt(text: &str) -> ClientAction {
    ClientAction::CreateInteraction {
        prompt: text.to_string(),
    }
}

#[tokio::test]
async fn single_job_runs_to_completion() {
    let manager = manager();
    let mut worker = TestWorker::connect(&manager).await;
    let mut client = client_in_new_group(&manager, "solo").await;

    client.act(prompt("hi")).await.unwrap();
    client.infos(|i| i.queue_position == 1).await;
    let dispatched = client.infos(|i| i.queue_position == 0).await;
    assert_eq!(dispatched.status, GroupStatus::Processing);

    let transcript = worker.start_job().await;
    assert_eq!(
        transcript,
        vec![
            ChatMessage::new(Role::System, DEFAULT_SYSTEM_PROMPT),
            ChatMessage::new(Role::User, "hi"),
        ]
    );

    worker.reply(&["He", "llo"]).await;
    let done = client.interaction(InteractionStatus::Completed).await;
    assert_eq!(done.prompt, "hi");
    assert_eq!(done.response, "Hello");
    client.infos(|i| i.status == GroupStatus::Idle).await;
    assert!(worker.session.is_idle().await);
}

#[tokio::test]
async fn second_group_waits_for_the_only_worker() {
    let manager = manager();
    let mut worker = TestWorker::connect(&manager).await;
    let mut first = client_in_new_group(&manager, "first").await;
    let mut second = client_in_new_group(&manager, "second").await;

    first.act(prompt("one")).await.unwrap();
    worker.start_job().await;

    second.act(prompt("two")).await.unwrap();
    let waiting = second.infos(|i| i.queue_position == 1).await;
    assert_eq!(waiting.status, GroupStatus::Processing);
    assert_eq!(
        manager.queued_group_ids().await,
        vec![second.group().await.id().to_string()]
    );

    worker.reply(&["done"]).await;
    first.interaction(InteractionStatus::Completed).await;

    let transcript = worker.start_job().await;
    assert_eq!(transcript.last().unwrap().content, "two");
    second.infos(|i| i.queue_position == 0).await;
    assert!(manager.queued_group_ids().await.is_empty());

    worker.reply(&["ok"]).await;
    let done = second.interaction(InteractionStatus::Completed).await;
    assert_eq!(done.response, "ok");
}

#[tokio::test]
async fn queue_positions_follow_fifo_order() {
    let manager = manager();
    let mut worker = TestWorker::connect(&manager).await;
    let mut a = client_in_new_group(&manager, "a").await;
    let mut b = client_in_new_group(&manager, "b").await;
    let mut c = client_in_new_group(&manager, "c").await;

    a.act(prompt("a")).await.unwrap();
    worker.start_job().await;
    b.act(prompt("b")).await.unwrap();
    c.act(prompt("c")).await.unwrap();
    b.infos(|i| i.queue_position == 1).await;
    c.infos(|i| i.queue_position == 2).await;

    b.act(ClientAction::AbortInteraction).await.unwrap();
    b.interaction(InteractionStatus::Aborted).await;
    c.infos(|i| i.queue_position == 1).await;

    worker.reply(&[]).await;
    a.interaction(InteractionStatus::Completed).await;
    let transcript = worker.start_job().await;
    assert_eq!(transcript.last().unwrap().content, "c");
}

#[tokio::test]
async fn aborting_a_queued_interaction_never_reaches_a_worker() {
    let manager = manager();
    let mut client = client_in_new_group(&manager, "queued").await;

    client.act(prompt("later")).await.unwrap();
    client.interaction(InteractionStatus::Queued).await;
    client.infos(|i| i.queue_position == 1).await;

    client.act(ClientAction::AbortInteraction).await.unwrap();
    let aborted = client.interaction(InteractionStatus::Aborted).await;
    assert_eq!(aborted.prompt, "later");
    assert!(manager.queued_group_ids().await.is_empty());
    assert_eq!(client.group().await.infos().status, GroupStatus::Idle);

    // A worker arriving afterwards finds nothing to do.
    let mut worker = TestWorker::connect(&manager).await;
    assert!(
        timeout(Duration::from_millis(100), worker.rx.recv())
            .await
            .is_err()
    );
    assert!(worker.session.is_idle().await);
}

#[tokio::test]
async fn abort_of_running_job_waits_for_worker() {
    let manager = manager();
    let mut worker = TestWorker::connect(&manager).await;
    let mut client = client_in_new_group(&manager, "abort").await;

    client.act(prompt("long story")).await.unwrap();
    worker.start_job().await;
    worker
        .emit(WorkerEvent::Chunk {
            text: "Once".to_string(),
        })
        .await;

    let session = Arc::clone(&client.session);
    let abort = tokio::spawn(async move { session.handle(ClientAction::AbortInteraction).await });

    assert_eq!(worker.command().await, WorkerCommand::AbortRequest);
    assert!(!abort.is_finished());
    worker.emit(WorkerEvent::Aborted).await;
    worker.emit(WorkerEvent::EndJob).await;

    timeout(WAIT, abort).await.unwrap().unwrap().unwrap();
    let aborted = client.interaction(InteractionStatus::Aborted).await;
    assert_eq!(aborted.response, "Once");
    assert_eq!(client.group().await.infos().status, GroupStatus::Idle);
}

#[tokio::test]
async fn abort_with_nothing_pending_is_rejected() {
    let manager = manager();
    let client = client_in_new_group(&manager, "idle").await;
    let err = client.act(ClientAction::AbortInteraction).await.unwrap_err();
    assert!(matches!(err, BrokerError::Request(_)));
}

#[tokio::test]
async fn worker_disconnect_fails_job_and_next_worker_takes_queue() {
    let manager = manager();
    let mut first_worker = TestWorker::connect(&manager).await;
    let mut running = client_in_new_group(&manager, "running").await;
    let mut waiting = client_in_new_group(&manager, "waiting").await;

    running.act(prompt("one")).await.unwrap();
    first_worker.start_job().await;
    waiting.act(prompt("two")).await.unwrap();
    waiting.infos(|i| i.queue_position == 1).await;

    first_worker.session.disconnect().await;

    let failed = running.interaction(InteractionStatus::Failed).await;
    assert_eq!(failed.prompt, "one");
    let notice = running
        .expect(|e| matches!(e, ClientEvent::Message(m) if m.status == StatusType::Error))
        .await;
    assert!(matches!(notice, ClientEvent::Message(m) if m.text.contains("worker disconnected")));
    assert_eq!(manager.population().await.workers, 0);
    assert_eq!(manager.queued_group_ids().await.len(), 1);

    let mut second_worker = TestWorker::connect(&manager).await;
    let transcript = second_worker.start_job().await;
    assert_eq!(transcript.last().unwrap().content, "two");
    waiting.infos(|i| i.queue_position == 0).await;
}

#[tokio::test]
async fn worker_error_marks_interaction_failed() {
    let manager = manager();
    let mut worker = TestWorker::connect(&manager).await;
    let mut client = client_in_new_group(&manager, "err").await;

    client.act(prompt("boom")).await.unwrap();
    worker.start_job().await;
    worker
        .emit(WorkerEvent::Error {
            message: "out of memory".to_string(),
        })
        .await;
    worker.emit(WorkerEvent::EndJob).await;

    client.interaction(InteractionStatus::Failed).await;
    let notice = client
        .expect(|e| matches!(e, ClientEvent::Message(_)))
        .await;
    assert!(matches!(notice, ClientEvent::Message(m) if m.text.contains("out of memory")));
    assert!(worker.session.is_idle().await);
}

#[tokio::test]
async fn busy_worker_refuses_a_second_job() {
    let manager = manager();
    let mut worker = TestWorker::connect(&manager).await;
    let client = client_in_new_group(&manager, "busy").await;
    let other = manager.create_group(Some("other".to_string())).await;

    client.act(prompt("one")).await.unwrap();
    worker.start_job().await;

    let err = worker.session.run_job(&other, Vec::new()).await.unwrap_err();
    assert_eq!(err, BrokerError::WorkerBusy);
    assert_eq!(
        worker.session.current_group().await.unwrap().id(),
        client.group().await.id()
    );
}

#[tokio::test]
async fn dispatch_without_work_is_a_no_op() {
    let manager = manager();
    let mut worker = TestWorker::connect(&manager).await;
    manager.dispatch().await;
    manager.dispatch().await;
    assert!(
        timeout(Duration::from_millis(100), worker.rx.recv())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn enqueue_twice_is_rejected() {
    let manager = manager();
    let group = manager.create_group(None).await;
    manager.enqueue(&group).await.unwrap();
    assert_eq!(manager.enqueue(&group).await, Err(BrokerError::AlreadyQueued));
    assert_eq!(manager.queued_group_ids().await.len(), 1);
    manager.dequeue_if_present(&group).await.unwrap();
    assert_eq!(
        manager.dequeue_if_present(&group).await,
        Err(BrokerError::NotQueued)
    );
}

#[tokio::test]
async fn second_interaction_rejected_while_one_is_pending() {
    let manager = manager();
    let mut client = client_in_new_group(&manager, "busy").await;
    client.act(prompt("one")).await.unwrap();
    let err = client.act(prompt("two")).await.unwrap_err();
    assert!(matches!(err, BrokerError::Request(_)));
    assert_eq!(client.group().await.history().await.len(), 1);
    client.interaction(InteractionStatus::Queued).await;
}

#[tokio::test]
async fn edit_reruns_with_new_prompt() {
    let manager = manager();
    let mut worker = TestWorker::connect(&manager).await;
    let mut client = client_in_new_group(&manager, "edit").await;

    client.act(prompt("first")).await.unwrap();
    worker.start_job().await;
    worker.reply(&["reply"]).await;
    let done = client.interaction(InteractionStatus::Completed).await;

    client
        .act(ClientAction::EditInteraction {
            interaction_id: done.id.clone(),
            prompt: "second".to_string(),
        })
        .await
        .unwrap();
    let queued = client.interaction(InteractionStatus::Queued).await;
    assert_eq!(queued.id, done.id);
    assert!(queued.response.is_empty());

    let transcript = worker.start_job().await;
    assert_eq!(transcript.last().unwrap(), &ChatMessage::new(Role::User, "second"));
    worker.reply(&["again"]).await;
    let redone = client.interaction(InteractionStatus::Completed).await;
    assert_eq!(redone.response, "again");
    assert_eq!(client.group().await.history().await.len(), 1);
}

#[tokio::test]
async fn delete_interaction_broadcasts_deleted_copy() {
    let manager = manager();
    let mut worker = TestWorker::connect(&manager).await;
    let mut client = client_in_new_group(&manager, "del").await;

    client.act(prompt("gone soon")).await.unwrap();
    worker.start_job().await;
    worker.reply(&["x"]).await;
    let done = client.interaction(InteractionStatus::Completed).await;

    client
        .act(ClientAction::DeleteInteraction {
            interaction_id: done.id.clone(),
        })
        .await
        .unwrap();
    let deleted = client.interaction(InteractionStatus::Deleted).await;
    assert_eq!(deleted.id, done.id);
    assert!(client.group().await.history().await.is_empty());
}

#[tokio::test]
async fn joining_replays_history() {
    let manager = manager();
    let mut worker = TestWorker::connect(&manager).await;
    let mut owner = client_in_new_group(&manager, "shared").await;
    owner.act(prompt("q")).await.unwrap();
    worker.start_job().await;
    worker.reply(&["a"]).await;
    owner.interaction(InteractionStatus::Completed).await;

    let group_id = owner.group().await.id().to_string();
    let mut guest = TestClient::connect(&manager).await;
    guest
        .act(ClientAction::JoinGroup {
            group_id: group_id.clone(),
        })
        .await
        .unwrap();
    let infos = guest.infos(|i| i.credential.id == group_id).await;
    assert_eq!(infos.status, GroupStatus::Idle);
    let replayed = guest.try_next_interaction().unwrap();
    assert_eq!(replayed.response, "a");
    assert_eq!(owner.group().await.member_count().await, 2);
}

#[tokio::test]
async fn joining_another_group_leaves_the_first() {
    let manager = manager();
    let client = client_in_new_group(&manager, "one").await;
    let first = client.group().await;
    let second = manager.create_group(Some("two".to_string())).await;

    client
        .act(ClientAction::JoinGroup {
            group_id: second.id().to_string(),
        })
        .await
        .unwrap();
    assert_eq!(first.member_count().await, 0);
    assert_eq!(second.member_count().await, 1);
    assert_eq!(client.group().await.id(), second.id());
}

#[tokio::test]
async fn join_unknown_group() {
    let manager = manager();
    let client = TestClient::connect(&manager).await;
    let err = client
        .act(ClientAction::JoinGroup {
            group_id: "missing".to_string(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::NotFound(_)));
}

#[tokio::test]
async fn group_actions_need_a_group() {
    let manager = manager();
    let client = TestClient::connect(&manager).await;
    assert_eq!(client.act(prompt("x")).await, Err(BrokerError::NoGroupBound));
    assert_eq!(
        client.act(ClientAction::LeaveGroup).await,
        Err(BrokerError::NoGroupBound)
    );
}

#[tokio::test]
async fn leaving_sends_neutral_infos() {
    let manager = manager();
    let mut client = client_in_new_group(&manager, "bye").await;
    let group = client.group().await;
    client.act(ClientAction::LeaveGroup).await.unwrap();
    client.infos(|i| *i == GroupInfos::default()).await;
    assert!(client.session.group().await.is_none());
    assert_eq!(group.member_count().await, 0);
}

#[tokio::test]
async fn deleting_a_group_detaches_members_and_unlists_it() {
    let manager = manager();
    let mut owner = client_in_new_group(&manager, "doomed").await;
    let group_id = owner.group().await.id().to_string();
    let mut guest = TestClient::connect(&manager).await;
    guest
        .act(ClientAction::JoinGroup {
            group_id: group_id.clone(),
        })
        .await
        .unwrap();
    owner.act(prompt("pending")).await.unwrap();

    owner.act(ClientAction::DeleteGroup).await.unwrap();
    owner.interaction(InteractionStatus::Aborted).await;
    owner.infos(|i| *i == GroupInfos::default()).await;
    guest.infos(|i| *i == GroupInfos::default()).await;
    assert!(guest.session.group().await.is_none());
    assert!(matches!(
        manager.group_by_credential_id(&group_id).await,
        Err(BrokerError::NotFound(_))
    ));
    assert!(manager.queued_group_ids().await.is_empty());
    assert!(manager.group_directory().await.is_empty());
}

#[tokio::test]
async fn population_tracks_connections() {
    let manager = manager();
    let mut client = TestClient::connect(&manager).await;
    let worker = TestWorker::connect(&manager).await;
    client
        .expect(|e| matches!(e, ClientEvent::Population(p) if p.workers == 1))
        .await;

    client
        .act(ClientAction::CreateGroup { title: None })
        .await
        .unwrap();
    let directory = client
        .expect(|e| matches!(e, ClientEvent::GroupDirectory(d) if !d.is_empty()))
        .await;
    assert!(matches!(directory, ClientEvent::GroupDirectory(d) if d[0].title == libinferlink::DEFAULT_GROUP_TITLE));

    worker.session.disconnect().await;
    let population = manager.population().await;
    assert_eq!(population.clients, 1);
    assert_eq!(population.workers, 0);
    assert_eq!(population.groups, 1);

    client.session.disconnect().await;
    assert_eq!(manager.population().await.clients, 0);
}

#[tokio::test]
async fn heartbeats_are_sent_on_schedule() {
    let manager = ConnectionManager::new(BrokerConfig {
        heartbeat_secs: 1,
        ..BrokerConfig::default()
    });
    let mut client = TestClient::connect(&manager).await;
    client
        .expect(|e| matches!(e, ClientEvent::Heartbeat))
        .await;
}

#[tokio::test]
async fn late_chunks_are_ignored() {
    let manager = manager();
    let worker = TestWorker::connect(&manager).await;
    worker
        .emit(WorkerEvent::Chunk {
            text: "stray".to_string(),
        })
        .await;
    worker.emit(WorkerEvent::EndJob).await;
    assert!(worker.session.is_idle().await);
}

#[tokio::test]
async fn finished_group_cannot_abort_the_next_job_on_its_worker() {
    let manager = manager();
    let mut worker = TestWorker::connect(&manager).await;
    let mut first = client_in_new_group(&manager, "first").await;
    let mut second = client_in_new_group(&manager, "second").await;

    first.act(prompt("one")).await.unwrap();
    worker.start_job().await;
    second.act(prompt("two")).await.unwrap();
    second.infos(|i| i.queue_position == 1).await;
    let first_group = first.group().await;

    worker.emit(WorkerEvent::EndJob).await;
    let transcript = worker.start_job().await;
    assert_eq!(transcript.last().unwrap().content, "two");
    assert_eq!(
        worker.session.current_group().await.unwrap().id(),
        second.group().await.id()
    );

    assert!(matches!(
        first_group.abort().await,
        Err(BrokerError::Request(_))
    ));
    assert!(!worker.session.request_abort(&first_group).await);
    assert!(
        timeout(Duration::from_millis(100), worker.rx.recv())
            .await
            .is_err()
    );

    first.interaction(InteractionStatus::Completed).await;
    worker.reply(&["fine"]).await;
    let done = second.interaction(InteractionStatus::Completed).await;
    assert_eq!(done.response, "fine");
}

#[tokio::test]
async fn deleting_a_running_group_waits_for_the_worker() {
    let manager = manager();
    let mut worker = TestWorker::connect(&manager).await;
    let mut owner = client_in_new_group(&manager, "running").await;
    let group_id = owner.group().await.id().to_string();

    owner.act(prompt("long")).await.unwrap();
    worker.start_job().await;

    let session = Arc::clone(&owner.session);
    let delete = tokio::spawn(async move { session.handle(ClientAction::DeleteGroup).await });

    assert_eq!(worker.command().await, WorkerCommand::AbortRequest);
    assert!(!delete.is_finished());
    assert!(owner.session.group().await.is_some());

    worker.emit(WorkerEvent::Aborted).await;
    worker.emit(WorkerEvent::EndJob).await;
    timeout(WAIT, delete).await.unwrap().unwrap().unwrap();

    owner.interaction(InteractionStatus::Aborted).await;
    owner.infos(|i| *i == GroupInfos::default()).await;
    assert!(owner.session.group().await.is_none());
    assert!(matches!(
        manager.group_by_credential_id(&group_id).await,
        Err(BrokerError::NotFound(_))
    ));
    assert!(worker.session.is_idle().await);
}

#[tokio::test]
async fn waiting_count_follows_the_queue() {
    let manager = manager();
    let mut client = client_in_new_group(&manager, "count").await;

    client.act(prompt("wait")).await.unwrap();
    client
        .expect(|e| matches!(e, ClientEvent::Population(p) if p.waiting == 1))
        .await;

    let mut worker = TestWorker::connect(&manager).await;
    worker.start_job().await;
    client
        .expect(|e| matches!(e, ClientEvent::Population(p) if p.waiting == 0 && p.workers == 1))
        .await;
}
