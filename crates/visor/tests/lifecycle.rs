//! End-to-end lifecycle scenarios.
//!
//! Drives the full entity graph — app, revision, proc type, instance —
//! through registration, scaling, ticket handling, and watching, against
//! an in-process store. No network needed.

use std::sync::Arc;

use tokio::sync::mpsc;
use visor::{
    App, InsState, Instance, MemStore, ProcType, Revision, Snapshot, TicketOp, Versioned,
};

async fn fleet() -> Snapshot {
    let s = visor::attach(Arc::new(MemStore::new()), visor::DEFAULT_ROOT)
        .await
        .unwrap();
    let rev = visor::init(&s).await.unwrap();
    s.fast_forward(rev).await.unwrap()
}

async fn registered_stack(s: &Snapshot, app: &str, ref_name: &str) -> (App, Revision, ProcType) {
    let app = App::new(app, "git://ins.git", "insane", s.clone())
        .register()
        .await
        .unwrap();
    let mut revision = Revision::new(&app, ref_name, app.path.snapshot.clone());
    revision.archive_url = format!("archive://{ref_name}");
    let revision = revision.register().await.unwrap();
    let pty = ProcType::new(&app, visor::DEFAULT_PROC_NAME, revision.path.snapshot.clone())
        .register()
        .await
        .unwrap();
    (app, revision, pty)
}

#[tokio::test]
async fn app_registration_and_env_round_trip() {
    let s = fleet().await;

    let mut app = App::new("lolcatapp", "git://cat.git", "whiskers", s);
    app.env.insert("VAR1".to_string(), "VAL1".to_string());
    app.env.insert("VAR2".to_string(), "VAL2".to_string());

    let app = app.register().await.unwrap();
    assert!(app.register().await.unwrap_err().is_key_conflict());

    let env = app.environment_vars().await.unwrap();
    assert_eq!(env.len(), 2);
    assert_eq!(env["VAR1"], "VAL1");
    assert_eq!(env["VAR2"], "VAL2");

    let fetched = visor::get_app(&app.path.snapshot, "lolcatapp").await.unwrap();
    assert_eq!(fetched.repo_url, "git://cat.git");
    assert_eq!(fetched.deploy_type, visor::DEPLOY_LXC);
}

#[tokio::test]
async fn scaling_up_then_down_produces_matching_tickets() {
    let s = fleet().await;
    let (_, _, pty) = registered_stack(&s, "ins-test", "7abcde6").await;
    let s = pty.path.snapshot.clone();

    // 0 → 9: nine start tickets.
    let s = visor::scale("ins-test", "7abcde6", "web", 9, &s).await.unwrap();
    let (factor, _) = s.get_scale("ins-test", "7abcde6", "web").await.unwrap();
    assert_eq!(factor, 9);

    let work = visor::tickets(&s).await.unwrap();
    assert_eq!(work.len(), 9);
    assert!(work.iter().all(|t| t.op == TicketOp::Start));

    // Agents drain the queue.
    for ticket in work {
        let claimed = ticket.claim("agent-1:999").await.unwrap();
        claimed.done().await.unwrap();
    }

    // 9 → 4: five stop tickets.
    let s = s.fast_forward(-1).await.unwrap();
    let s = visor::scale("ins-test", "7abcde6", "web", 4, &s).await.unwrap();
    let (factor, _) = s.get_scale("ins-test", "7abcde6", "web").await.unwrap();
    assert_eq!(factor, 4);

    let work = visor::tickets(&s).await.unwrap();
    assert_eq!(work.len(), 5);
    assert!(work.iter().all(|t| t.op == TicketOp::Stop));
}

#[tokio::test]
async fn instances_register_and_report_through_the_watcher() {
    let s = fleet().await;
    let (_, revision, pty) = registered_stack(&s, "ins-test", "7abcde6").await;
    let head = pty.path.snapshot.clone();

    let (tx, mut rx) = mpsc::channel(16);
    let watcher = tokio::spawn(visor::watch_instance(head.clone(), tx));

    let port = visor::claim_next_port(&head).await.unwrap();
    assert_eq!(port, visor::START_PORT);

    let ins = Instance::new(
        &pty,
        &revision,
        &format!("10.0.0.1:{port}"),
        InsState::Initial,
        head.fast_forward(-1).await.unwrap(),
    )
    .unwrap()
    .register()
    .await
    .unwrap();

    let seen = rx.recv().await.unwrap();
    assert_eq!(seen.app_name, "ins-test");
    assert_eq!(seen.ref_name, "7abcde6");
    assert_eq!(seen.proc_name, "web");
    assert_eq!(seen.port, 8000);
    assert_eq!(seen.state, InsState::Initial);

    // The instance comes up and its state changes survive a re-read.
    let ins = ins.update_state(InsState::Started).await.unwrap();
    let ins = ins.update_state(InsState::Ready).await.unwrap();
    let listed = visor::proc_type_instances(ins.snapshot(), &pty).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].state, InsState::Ready);

    drop(rx);
    watcher.abort();
}

#[tokio::test]
async fn stale_snapshots_must_fast_forward_to_write() {
    let s = fleet().await;

    // Another writer gets there first.
    let s1 = s.set("flag", "original").await.unwrap();
    s1.set("flag", "changed").await.unwrap();

    let err = s1.update("flag", "mine").await.unwrap_err();
    assert!(err.is_rev_mismatch());

    let head = s1.fast_forward(-1).await.unwrap();
    let s2 = head.update("flag", "mine").await.unwrap();
    assert_eq!(s2.get("flag").await.unwrap().0, "mine");
}

#[tokio::test]
async fn unregistered_subtrees_disappear_from_listings() {
    let s = fleet().await;
    let (app, revision, pty) = registered_stack(&s, "ins-test", "7abcde6").await;
    let head = pty.path.snapshot.clone();

    let ins = Instance::new(&pty, &revision, "10.0.0.1:9000", InsState::Initial, head)
        .unwrap()
        .register()
        .await
        .unwrap();

    assert_eq!(visor::instances(ins.snapshot()).await.unwrap().len(), 1);
    assert_eq!(
        visor::host_instances(ins.snapshot(), "10.0.0.1")
            .await
            .unwrap()
            .len(),
        1
    );

    let app = app.fast_forward(-1).await.unwrap();
    app.unregister().await.unwrap();

    let head = ins.snapshot().fast_forward(-1).await.unwrap();
    assert!(visor::apps(&head).await.unwrap().is_empty());
    assert!(visor::instances(&head).await.unwrap().is_empty());
}
