use oscwire::{BootBehavior, LoopbackLauncher, OscType, WireError};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use switchboard::{
    synthdefs, BootStatus, ContainerId, Resource, Session, SessionOptions, SwitchboardError,
    TrackOutput,
};
use tokio_test::assert_ok;

const BOOTED: &str = "\
<session.contexts[0]>
    NODE TREE 1000 group (session.mixers[0]:group)
        1001 group (session.mixers[0]:tracks)
            1006 group (session.mixers[0].tracks[0]:group)
                1007 group (session.mixers[0].tracks[0]:tracks)
                1010 switchboard:meters:2 (session.mixers[0].tracks[0]:input-levels)
                    in_: 18.0, out: 7.0
                1008 group (session.mixers[0].tracks[0]:devices)
                1009 switchboard:channel-strip:2 (session.mixers[0].tracks[0]:channel-strip)
                    active: c5, bus: 18.0, gain: c6, gate: 1.0
                1011 switchboard:meters:2 (session.mixers[0].tracks[0]:output-levels)
                    in_: 18.0, out: 9.0
                1012 switchboard:patch-cable:2x2 (session.mixers[0].tracks[0].output:synth)
                    active: c5, gain: 0.0, gate: 1.0, in_: 18.0, out: 16.0
        1004 switchboard:meters:2 (session.mixers[0]:input-levels)
            in_: 16.0, out: 1.0
        1002 group (session.mixers[0]:devices)
        1003 switchboard:channel-strip:2 (session.mixers[0]:channel-strip)
            active: 1.0, bus: 16.0, gain: c0, gate: 1.0
        1005 switchboard:meters:2 (session.mixers[0]:output-levels)
            in_: 16.0, out: 3.0
        1013 switchboard:patch-cable:2x2 (session.mixers[0].output:synth)
            active: 1.0, gain: 0.0, gate: 1.0, in_: 16.0, out: 0.0";

async fn session() -> (Arc<LoopbackLauncher>, Session) {
    let launcher = Arc::new(LoopbackLauncher::new(synthdefs::descriptors()));
    let options = SessionOptions {
        release_grace: Duration::from_millis(100),
        ..SessionOptions::default()
    };
    let session = Session::new(options, launcher.clone()).await.unwrap();
    (launcher, session)
}

fn reposition_commands(launcher: &LoopbackLauncher) -> Vec<(String, Vec<OscType>)> {
    launcher
        .latest()
        .unwrap()
        .sent_messages()
        .into_iter()
        .filter(|m| ["/g_head", "/g_tail", "/n_before", "/n_after"].contains(&m.addr.as_str()))
        .map(|m| (m.addr, m.args))
        .collect()
}

#[tokio::test]
async fn boot_builds_the_default_mixer() {
    let (_launcher, session) = session().await;
    assert_ok!(session.boot().await);
    assert_eq!(session.status().await, BootStatus::Online);
    assert_eq!(session.dump_tree().await.unwrap(), BOOTED);
}

#[tokio::test]
async fn boot_and_quit_are_idempotent() {
    let (launcher, session) = session().await;
    session.boot().await.unwrap();
    session.boot().await.unwrap();
    assert_eq!(launcher.launched(), 1);

    session.quit().await.unwrap();
    session.quit().await.unwrap();
    assert_eq!(session.status().await, BootStatus::Offline);
    assert_eq!(launcher.live_processes(), 0);
    assert!(launcher.latest().unwrap().has_quit());
}

#[tokio::test]
async fn reboot_reproduces_the_same_tree() {
    let (_launcher, session) = session().await;
    let mixer = session.mixers().await[0];
    let track = session.tracks(mixer).await[0];
    session.add_track(track).await.unwrap();
    session.add_device(mixer).await.unwrap();

    session.boot().await.unwrap();
    let tree = session.dump_tree().await.unwrap();
    let components = session.dump_components().await;

    session.quit().await.unwrap();
    assert!(!session.dump_components().await.contains("nodes="));

    session.boot().await.unwrap();
    assert_eq!(session.dump_tree().await.unwrap(), tree);
    assert_eq!(session.dump_components().await, components);
}

#[tokio::test]
async fn dump_tree_needs_an_online_session() {
    let (_launcher, session) = session().await;
    assert!(matches!(
        session.dump_tree().await,
        Err(SwitchboardError::InvalidStatus {
            expected: BootStatus::Online,
            actual: BootStatus::Offline,
        })
    ));
    assert!(session
        .dump_components()
        .await
        .starts_with("session.mixers[0] (mixer)"));
}

#[tokio::test(start_paused = true)]
async fn stalled_boot_leaves_the_session_offline() {
    let (launcher, session) = session().await;
    launcher.set_behavior(BootBehavior::Stall);

    let result = session.boot().await;
    assert!(matches!(
        result,
        Err(SwitchboardError::Wire(WireError::Timeout { .. }))
    ));
    assert_eq!(session.status().await, BootStatus::Offline);
    assert_eq!(launcher.live_processes(), 0);

    let mixer = session.mixers().await[0];
    assert_eq!(session.node(mixer, Resource::Group).await, None);
}

#[tokio::test(start_paused = true)]
async fn unresponsive_server_fails_the_boot() {
    let (launcher, session) = session().await;
    launcher.set_behavior(BootBehavior::Unresponsive);

    assert!(session.boot().await.is_err());
    assert_eq!(session.status().await, BootStatus::Offline);
    assert_eq!(launcher.live_processes(), 0);

    launcher.set_behavior(BootBehavior::Ready);
    session.boot().await.unwrap();
    assert_eq!(session.dump_tree().await.unwrap(), BOOTED);
}

#[tokio::test]
async fn moving_a_track_repositions_its_group_once() {
    let (launcher, session) = session().await;
    let mixer = session.mixers().await[0];
    let one = session.tracks(mixer).await[0];
    let two = session.add_track(mixer).await.unwrap();
    session.boot().await.unwrap();

    let engine = launcher.latest().unwrap();
    let tracks_group = session.node(mixer, Resource::Tracks).await.unwrap();
    let one_group = session.node(one, Resource::Group).await.unwrap();
    let two_group = session.node(two, Resource::Group).await.unwrap();

    engine.clear_transcript();
    session.move_track(two, mixer, 0).await.unwrap();
    assert_eq!(
        reposition_commands(&launcher),
        vec![(
            "/g_head".to_string(),
            vec![OscType::Int(tracks_group), OscType::Int(two_group)]
        )]
    );
    assert_eq!(engine.sent_messages().len(), 1);
    assert_eq!(session.tracks(mixer).await, vec![two, one]);
    assert_eq!(session.graph_order(two).await, Some(vec![0, 0]));

    engine.clear_transcript();
    session.move_track(two, mixer, 5).await.unwrap();
    assert_eq!(
        reposition_commands(&launcher),
        vec![(
            "/n_after".to_string(),
            vec![OscType::Int(two_group), OscType::Int(one_group)]
        )]
    );
    assert_eq!(session.tracks(mixer).await, vec![one, two]);
}

#[tokio::test]
async fn moving_the_last_of_four_tracks_follows_its_new_sibling() {
    let (launcher, session) = session().await;
    let mixer = session.mixers().await[0];
    let one = session.tracks(mixer).await[0];
    let two = session.add_track(mixer).await.unwrap();
    let three = session.add_track(mixer).await.unwrap();
    let four = session.add_track(mixer).await.unwrap();
    session.boot().await.unwrap();

    let engine = launcher.latest().unwrap();
    let one_group = session.node(one, Resource::Group).await.unwrap();
    let four_group = session.node(four, Resource::Group).await.unwrap();

    engine.clear_transcript();
    session.move_track(four, mixer, 1).await.unwrap();
    assert_eq!(
        reposition_commands(&launcher),
        vec![(
            "/n_after".to_string(),
            vec![OscType::Int(four_group), OscType::Int(one_group)]
        )]
    );
    assert_eq!(engine.sent_messages().len(), 1);
    assert_eq!(session.tracks(mixer).await, vec![one, four, two, three]);
    assert_eq!(session.graph_order(four).await, Some(vec![0, 1]));
}

#[tokio::test]
async fn moving_to_the_current_position_does_nothing() {
    let (launcher, session) = session().await;
    let mixer = session.mixers().await[0];
    let one = session.tracks(mixer).await[0];
    session.boot().await.unwrap();

    let engine = launcher.latest().unwrap();
    engine.clear_transcript();
    session.move_track(one, mixer, 0).await.unwrap();
    assert!(engine.sent_messages().is_empty());
}

#[tokio::test]
async fn invalid_moves_and_routes_are_rejected() {
    let (_launcher, session) = session().await;
    let first = session.mixers().await[0];
    let second = session.add_mixer(None).await.unwrap();
    let track = session.tracks(first).await[0];
    let child = session.add_track(track).await.unwrap();

    assert!(matches!(
        session.move_track(track, child, 0).await,
        Err(SwitchboardError::SelfParenting { .. })
    ));
    assert!(matches!(
        session.move_track(track, track, 0).await,
        Err(SwitchboardError::SelfParenting { .. })
    ));
    assert!(matches!(
        session.move_track(track, second, 0).await,
        Err(SwitchboardError::CrossMixer { .. })
    ));
    assert!(matches!(
        session.add_send(track, second, true).await,
        Err(SwitchboardError::CrossMixer { .. })
    ));
    assert!(matches!(
        session
            .set_output(track, TrackOutput::Container(ContainerId::Track(track)))
            .await,
        Err(SwitchboardError::SelfRouting { .. })
    ));
    assert_eq!(session.tracks(first).await, vec![track]);
}

#[tokio::test]
async fn backward_sends_write_through_the_feedback_bus() {
    let (launcher, session) = session().await;
    let mixer = session.mixers().await[0];
    let one = session.tracks(mixer).await[0];
    let two = session.add_track(mixer).await.unwrap();
    let send = session.add_send(two, one, true).await.unwrap();
    session.boot().await.unwrap();
    let context = session.contexts().await[0];

    let feedback_bus = session.audio_bus(one, Resource::Feedback).await.unwrap();
    let state = session.connection_state(send).await.unwrap();
    assert_eq!(state.feedsback, Some(true));
    assert_eq!(state.target_bus, Some(feedback_bus));
    let (audio, _) = session.bus_usage(context).await.unwrap();

    let dump = session.dump_tree().await.unwrap();
    assert!(dump.contains(
        "switchboard:fb-patch-cable:2x2 (session.mixers[0].tracks[0].feedback:synth)"
    ));
    assert!(dump.contains("(session.mixers[0].tracks[1].sends[0]:synth)"));

    session.delete_send(send).await.unwrap();
    assert_eq!(session.audio_bus(one, Resource::Feedback).await, None);
    assert_eq!(session.bus_usage(context).await.unwrap().0, audio - 1);
    session.sync().await.unwrap();
    let dump = session.dump_tree().await.unwrap();
    assert!(!dump.contains("fb-patch-cable"));
    assert!(!dump.contains("sends[0]"));
    assert!(launcher.latest().unwrap().sent_messages().iter().any(|m| m.addr == "/n_free"));
}

#[tokio::test]
async fn reordering_clears_feedback() {
    let (_launcher, session) = session().await;
    let mixer = session.mixers().await[0];
    let one = session.tracks(mixer).await[0];
    let two = session.add_track(mixer).await.unwrap();
    let send = session.add_send(two, one, true).await.unwrap();
    session.boot().await.unwrap();
    assert!(session.audio_bus(one, Resource::Feedback).await.is_some());

    session.move_track(two, mixer, 0).await.unwrap();
    let state = session.connection_state(send).await.unwrap();
    assert_eq!(state.feedsback, Some(false));
    assert_eq!(
        state.target_bus,
        session.audio_bus(one, Resource::Main).await
    );
    assert_eq!(session.audio_bus(one, Resource::Feedback).await, None);
}

#[tokio::test]
async fn unchanged_connections_are_not_rebuilt() {
    let (launcher, session) = session().await;
    let mixer = session.mixers().await[0];
    let track = session.tracks(mixer).await[0];
    let send = session.add_send(track, mixer, false).await.unwrap();
    session.boot().await.unwrap();

    let engine = launcher.latest().unwrap();
    engine.clear_transcript();
    session.set_output(track, TrackOutput::Default).await.unwrap();
    session.set_send_postfader(send, false).await.unwrap();
    assert!(engine.sent_messages().is_empty());

    session.set_send_postfader(send, true).await.unwrap();
    let commands: Vec<String> = engine.sent_messages().into_iter().map(|m| m.addr).collect();
    assert_eq!(commands, vec!["/n_free".to_string(), "/s_new".to_string()]);
}

#[tokio::test]
async fn devices_write_into_their_container() {
    let (launcher, session) = session().await;
    let mixer = session.mixers().await[0];
    let track = session.tracks(mixer).await[0];
    session.boot().await.unwrap();

    let device = session.add_device(track).await.unwrap();
    session.sync().await.unwrap();
    let dump = session.dump_tree().await.unwrap();
    assert!(dump.contains("group (session.mixers[0].tracks[0].devices[0]:group)"));
    assert!(dump.contains(
        "switchboard:device-dc-tester:2 (session.mixers[0].tracks[0].devices[0]:synth)"
    ));
    assert!(dump.contains("dc: 1.0, out: 18.0"));

    session.set_device_active(device, false).await.unwrap();
    let group = session.node(device, Resource::Group).await.unwrap();
    let engine = launcher.latest().unwrap();
    assert_eq!(engine.is_running(group), Some(false));
}

#[tokio::test]
async fn muting_a_track_zeroes_its_active_bus() {
    let (launcher, session) = session().await;
    let mixer = session.mixers().await[0];
    let track = session.tracks(mixer).await[0];
    session.boot().await.unwrap();

    let active = session.control_bus(track, Resource::Active).await.unwrap();
    session.set_track_active(track, false).await.unwrap();
    let engine = launcher.latest().unwrap();
    assert_eq!(engine.control_bus(active.index), Some(0.0));
    assert_eq!(session.is_active(track).await, Some(false));

    session.set_track_active(track, true).await.unwrap();
    assert_eq!(engine.control_bus(active.index), Some(1.0));
}

#[tokio::test(start_paused = true)]
async fn deleted_tracks_fade_out_before_being_freed() {
    let (launcher, session) = session().await;
    let mixer = session.mixers().await[0];
    let track = session.tracks(mixer).await[0];
    session.boot().await.unwrap();
    let group = session.node(track, Resource::Group).await.unwrap();
    let engine = launcher.latest().unwrap();

    session.delete_track(track).await.unwrap();
    assert!(engine.has_node(group));
    assert!(session.tracks(mixer).await.is_empty());

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!engine.has_node(group));
}

#[tokio::test]
async fn deleting_a_send_target_disconnects_the_send() {
    let (_launcher, session) = session().await;
    let mixer = session.mixers().await[0];
    let one = session.tracks(mixer).await[0];
    let two = session.add_track(mixer).await.unwrap();
    let send = session.add_send(one, two, true).await.unwrap();
    session.boot().await.unwrap();
    assert!(session.node(send, Resource::Synth).await.is_some());

    session.delete_track(two).await.unwrap();
    let state = session.connection_state(send).await.unwrap();
    assert_eq!(state.target_component, None);
    assert_eq!(session.node(send, Resource::Synth).await, None);
}

#[tokio::test]
async fn mixers_move_between_contexts() {
    let (launcher, session) = session().await;
    session.boot().await.unwrap();
    let mixer = session.mixers().await[0];
    let second = session.add_context().await.unwrap();
    assert_eq!(launcher.engines().len(), 2);

    session.set_mixer_context(mixer, second).await.unwrap();
    assert_eq!(session.mixer_context(mixer).await, Some(second));

    let dump = session.dump_tree().await.unwrap();
    let expected = BOOTED.replace("<session.contexts[0]>", "<session.contexts[0]>\n<session.contexts[1]>");
    assert_eq!(dump, expected);
    assert!(launcher.engines()[1].has_node(1000));
}

#[tokio::test]
async fn deleting_a_context_removes_its_mixers() {
    let (launcher, session) = session().await;
    session.boot().await.unwrap();
    let second = session.add_context().await.unwrap();
    let mixer = session.add_mixer(Some(second)).await.unwrap();
    assert_eq!(session.mixers().await.len(), 2);

    session.delete_context(second).await.unwrap();
    assert_eq!(session.contexts().await.len(), 1);
    assert!(!session.mixers().await.contains(&mixer));
    assert!(launcher.engines()[1].has_quit());
}
