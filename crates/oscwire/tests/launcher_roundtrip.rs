//! Launcher + transport behaviour against the loopback engine.

use oscwire::requests;
use oscwire::{
    request, BootBehavior, Launcher, LoopbackLauncher, OscPacket, Pattern, Response,
    ServerOptions, SynthDescriptor, WireError,
};
use std::time::Duration;
use tokio_test::assert_ok;

fn launcher() -> LoopbackLauncher {
    LoopbackLauncher::new(vec![SynthDescriptor {
        name: "tone".to_string(),
        parameters: vec![("freq".to_string(), 440.0)],
    }])
}

#[tokio::test]
async fn ready_engine_answers_notify() {
    let launcher = launcher();
    let options = ServerOptions::default();

    let mut process = launcher.launch(&options).await.unwrap();
    assert_ok!(process.wait_ready().await);
    let transport = launcher.connect(&options).await.unwrap();

    let reply = request(
        transport.as_ref(),
        OscPacket::Message(requests::notify(true)),
        Pattern::new("/done").with_arg("/notify".to_string()),
        options.reply_timeout,
    )
    .await
    .unwrap();
    assert!(matches!(reply, Response::Done { command, .. } if command == "/notify"));

    process.shutdown(Duration::from_millis(10)).await;
    assert_eq!(launcher.launched(), 1);
    assert_eq!(launcher.live_processes(), 0);
}

#[tokio::test(start_paused = true)]
async fn stalled_process_never_becomes_ready() {
    let launcher = launcher();
    launcher.set_behavior(BootBehavior::Stall);

    let mut process = launcher.launch(&ServerOptions::default()).await.unwrap();
    let waited = tokio::time::timeout(Duration::from_secs(5), process.wait_ready()).await;
    assert!(waited.is_err());
}

#[tokio::test(start_paused = true)]
async fn unresponsive_engine_times_out_requests() {
    let launcher = launcher();
    launcher.set_behavior(BootBehavior::Unresponsive);
    let options = ServerOptions::default();

    let transport = launcher.connect(&options).await.unwrap();
    let result = request(
        transport.as_ref(),
        OscPacket::Message(requests::sync(1)),
        Pattern::new("/synced").with_arg(1),
        Duration::from_millis(250),
    )
    .await;
    assert!(matches!(result, Err(WireError::Timeout { .. })));

    let engine = launcher.latest().unwrap();
    assert_eq!(engine.sent_messages().len(), 1);
}

#[tokio::test]
async fn each_connect_gets_a_fresh_tree() {
    let launcher = launcher();
    let options = ServerOptions::default();

    let first = launcher.connect(&options).await.unwrap();
    first
        .send(OscPacket::Message(requests::group_new(
            1,
            oscwire::AddAction::Head,
            0,
        )))
        .await
        .unwrap();

    let _second = launcher.connect(&options).await.unwrap();
    let engines = launcher.engines();
    assert_eq!(engines.len(), 2);
    assert!(engines[0].has_node(1));
    assert!(!engines[1].has_node(1));
}
