use oscwire::LoopbackLauncher;
use std::sync::Arc;
use std::time::Duration;
use switchboard::{synthdefs, Session, SessionOptions};
use switchconf::SwitchConfig;

#[tokio::test]
async fn sessions_are_built_from_config_files() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("switchboard.toml");
    std::fs::write(
        &path,
        "[server]\noutput_channels = 2\nrelease_grace_ms = 50\n\n\
         [bootstrap.clock]\nbeats_per_minute = 90.0\ntime_signature = [3, 4]\n",
    )
    .unwrap();

    let config = SwitchConfig::load_from(Some(&path)).unwrap();
    let options = SessionOptions::from_config(&config).unwrap();
    assert_eq!(options.release_grace, Duration::from_millis(50));
    assert_eq!(options.server.output_channels, 2);

    let launcher = Arc::new(LoopbackLauncher::new(synthdefs::descriptors()));
    let session = Session::new(options, launcher).await.unwrap();
    assert_eq!(session.clock().tempo_map().tempo_at(0.0), 90.0);

    session.boot().await.unwrap();
    let dump = session.dump_tree().await.unwrap();
    // two hardware outputs and eight inputs put the first private bus at 10
    assert!(dump.contains("active: 1.0, bus: 10.0, gain: c0, gate: 1.0"));
    session.quit().await.unwrap();
}
