//! End-to-end tests of the FPS over a virtual fleet.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use jaeger::bus::{BusInterface, VirtualBus};
use jaeger::commands::{self, Command, CommandID, CommandStatus};
use jaeger::config::Config;
use jaeger::error::JaegerError;
use jaeger::fps::{Fps, FpsRegistry};
use jaeger::maskbits::{FPSStatus, PositionerStatus};
use jaeger::trajectory::{TrajectoryData, TrajectoryPath};

fn test_config(tag: &str) -> Config {
    let mut config = Config::default();
    config.fps.initialise_timeouts = 0.15;
    config.fps.start_pollers = false;
    config.files.lock_file = std::env::temp_dir().join(format!(
        "jaeger-test-{}-{}.lock",
        tag,
        std::process::id()
    ));
    config
}

fn virtual_fleet(n: u16, time_scale: f64) -> (Arc<VirtualBus>, Vec<Arc<dyn BusInterface>>) {
    let bus = Arc::new(
        VirtualBus::new("virtual0")
            .with_time_scale(time_scale)
            .with_positioners(n),
    );
    (Arc::clone(&bus), vec![bus as Arc<dyn BusInterface>])
}

#[tokio::test]
async fn test_discovery_on_fresh_virtual_fleet() {
    let registry = FpsRegistry::new();
    let (_bus, interfaces) = virtual_fleet(10, 1.0);
    let fps = Fps::create(&registry, test_config("discovery"), interfaces)
        .await
        .unwrap();

    assert_eq!(fps.n_positioners().await, 10);
    for pid in fps.positioner_ids().await {
        let positioner = fps.positioner(pid).await.unwrap();
        assert!(positioner.initialised, "positioner {pid} not initialised");
        assert!(positioner.status.contains(
            PositionerStatus::SYSTEM_INITIALIZED | PositionerStatus::DISPLACEMENT_COMPLETED
        ));
        assert!(positioner.firmware.is_some());
    }
    assert_eq!(fps.status(), FPSStatus::IDLE | FPSStatus::TEMPERATURE_NORMAL);
    assert!(!fps.locked());

    fps.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_collision_locks_the_fleet() {
    let registry = FpsRegistry::new();
    let (bus, interfaces) = virtual_fleet(5, 1.0);
    bus.insert_status(4, PositionerStatus::COLLISION_BETA);

    let fps = Fps::new(&registry, test_config("collision"), interfaces).unwrap();
    fps.start_can().unwrap();
    let mut events = fps.subscribe_events();
    fps.initialise(Some(false), true).await.unwrap();

    assert!(fps.locked());
    assert_eq!(fps.locked_by(), vec![4]);
    assert!(fps.status().intersects(FPSStatus::COLLIDED));

    let event = events.recv().await.unwrap();
    assert!(event.locked);
    assert_eq!(event.locked_by, vec![4]);
    assert_eq!(event.locked_axes, "beta");

    // Non-safe commands are rejected while locked.
    let err = fps
        .send_command(
            Command::new(CommandID::GotoAlpha, vec![4])
                .with_data(commands::angle_payload(10.0)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, JaegerError::FpsLocked));

    // Unlock sends STOP_TRAJECTORY, which clears the collided flags.
    fps.unlock(false).await.unwrap();
    assert!(!fps.locked());
    assert!(fps.locked_by().is_empty());

    fps.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_goto_happy_path_with_status_transitions() {
    let registry = FpsRegistry::new();
    let (_bus, interfaces) = virtual_fleet(3, 0.3);
    let fps = Fps::create(&registry, test_config("goto"), interfaces)
        .await
        .unwrap();

    let mut status_rx = fps.subscribe_status();

    fps.goto(
        HashMap::from([(1, (90.0, 180.0)), (2, (45.0, 200.0))]),
        Some(1000.0),
        false,
    )
    .await
    .unwrap();

    let p1 = fps.positioner(1).await.unwrap();
    assert!((p1.alpha.unwrap() - 90.0).abs() < 1e-3);
    assert!((p1.beta.unwrap() - 180.0).abs() < 1e-3);
    let p2 = fps.positioner(2).await.unwrap();
    assert!((p2.alpha.unwrap() - 45.0).abs() < 1e-3);
    assert!((p2.beta.unwrap() - 200.0).abs() < 1e-3);

    // Positioner 3 was not commanded.
    let p3 = fps.positioner(3).await.unwrap();
    assert!((p3.alpha.unwrap()).abs() < 1e-3);

    // The IDLE -> MOVING -> IDLE transitions were observable.
    let mut saw_moving = false;
    let mut saw_idle_after_moving = false;
    while let Ok(status) = status_rx.try_recv() {
        if status.intersects(FPSStatus::MOVING) {
            saw_moving = true;
        } else if saw_moving && status.intersects(FPSStatus::IDLE) {
            saw_idle_after_moving = true;
        }
    }
    assert!(saw_moving, "MOVING state never observed");
    assert!(saw_idle_after_moving, "return to IDLE never observed");

    fps.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_second_goto_rejected_while_moving() {
    let registry = FpsRegistry::new();
    let (_bus, interfaces) = virtual_fleet(2, 0.3);
    let fps = Fps::create(&registry, test_config("moving"), interfaces)
        .await
        .unwrap();

    let first_fps = Arc::clone(&fps);
    let first = tokio::spawn(async move {
        first_fps
            .goto(HashMap::from([(1, (180.0, 90.0))]), Some(500.0), false)
            .await
    });

    // Give the first goto time to dispatch and be seen as MOVING.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(fps.moving());

    let err = fps
        .goto(HashMap::from([(2, (10.0, 10.0))]), None, false)
        .await
        .unwrap_err();
    assert!(matches!(err, JaegerError::FpsMoving));

    // The first goto is unaffected and completes.
    first.await.unwrap().unwrap();
    let p1 = fps.positioner(1).await.unwrap();
    assert!((p1.alpha.unwrap() - 180.0).abs() < 1e-3);

    fps.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_broadcast_discovery_quiescence() {
    let registry = FpsRegistry::new();
    let (_bus, interfaces) = virtual_fleet(3, 1.0);
    let fps = Fps::create(&registry, test_config("quiescence"), interfaces)
        .await
        .unwrap();

    // Unknown population: the command completes after the quiescence
    // window with exactly the replies that arrived.
    let command = fps
        .send_command(
            Command::broadcast(CommandID::GetFirmwareVersion)
                .with_timeout(Duration::from_millis(200)),
        )
        .await
        .unwrap();

    assert_eq!(command.wait().await, CommandStatus::Done);
    assert_eq!(command.replies().len(), 3);

    fps.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_emergency_abort_is_immediate_and_broadcast() {
    let registry = FpsRegistry::new();
    let (bus, interfaces) = virtual_fleet(3, 1.0);
    let fps = Fps::create(&registry, test_config("abort"), interfaces)
        .await
        .unwrap();

    let before = bus
        .command_log()
        .iter()
        .filter(|(_, c)| *c == CommandID::SendTrajectoryAbort)
        .count();

    fps.send_now(Command::broadcast(CommandID::SendTrajectoryAbort))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let after = bus
        .command_log()
        .iter()
        .filter(|(_, c)| *c == CommandID::SendTrajectoryAbort)
        .count();
    assert_eq!(after - before, 3, "abort did not reach every positioner");

    fps.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_send_trajectory_round_trip() {
    let registry = FpsRegistry::new();
    let (_bus, interfaces) = virtual_fleet(2, 0.3);
    let fps = Fps::create(&registry, test_config("trajectory"), interfaces)
        .await
        .unwrap();

    let mut data = TrajectoryData::new();
    data.insert(
        1,
        TrajectoryPath {
            alpha: vec![(0.0, 0.5), (30.0, 1.0)],
            beta: vec![(0.0, 0.5), (40.0, 1.2)],
        },
    );
    data.insert(
        2,
        TrajectoryPath {
            alpha: vec![(0.0, 0.5), (15.0, 1.0)],
            beta: vec![(0.0, 0.5), (10.0, 1.0)],
        },
    );

    let trajectory = fps.send_trajectory(data).await.unwrap();
    assert!(trajectory.started);
    assert_eq!(trajectory.move_time, 1.2);
    let mut uploaded = trajectory.uploaded.clone();
    uploaded.sort_unstable();
    assert_eq!(uploaded, vec![1, 2]);

    fps.update_position(None, Duration::from_secs(2)).await.unwrap();
    let p1 = fps.positioner(1).await.unwrap();
    assert!((p1.alpha.unwrap() - 30.0).abs() < 1e-3);
    assert!((p1.beta.unwrap() - 40.0).abs() < 1e-3);

    fps.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_registry_enforces_singleton() {
    let registry = FpsRegistry::new();
    let (_bus, interfaces) = virtual_fleet(1, 1.0);
    let fps = Fps::new(&registry, test_config("singleton"), interfaces).unwrap();

    assert!(Arc::ptr_eq(&registry.instance().unwrap(), &fps));

    let (_bus2, interfaces2) = virtual_fleet(1, 1.0);
    let err = Fps::new(&registry, test_config("singleton-second"), interfaces2).unwrap_err();
    assert!(matches!(err, JaegerError::AlreadyRunning));

    fps.shutdown().await.unwrap();
    assert!(registry.instance().is_none());
}

#[tokio::test]
async fn test_lock_file_blocks_startup() {
    let config = test_config("lockfile");
    std::fs::write(&config.files.lock_file, b"").unwrap();

    let registry = FpsRegistry::new();
    let (_bus, interfaces) = virtual_fleet(1, 1.0);
    let err = Fps::new(&registry, config.clone(), interfaces).unwrap_err();
    assert!(matches!(err, JaegerError::LockFilePresent(_)));

    std::fs::remove_file(&config.files.lock_file).ok();
}

#[tokio::test]
async fn test_lock_does_not_duplicate_locked_by() {
    let registry = FpsRegistry::new();
    let (_bus, interfaces) = virtual_fleet(3, 1.0);
    let fps = Fps::create(&registry, test_config("lock-dedupe"), interfaces)
        .await
        .unwrap();

    fps.lock(false, Some(vec![2]), false, false).await.unwrap();
    fps.lock(false, Some(vec![2, 3]), false, false).await.unwrap();
    assert_eq!(fps.locked_by(), vec![2, 3]);

    fps.unlock(false).await.unwrap();
    fps.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_stop_trajectory_is_idempotent() {
    let registry = FpsRegistry::new();
    let (_bus, interfaces) = virtual_fleet(2, 1.0);
    let fps = Fps::create(&registry, test_config("stop-idempotent"), interfaces)
        .await
        .unwrap();

    fps.stop_trajectory(false).await.unwrap();
    fps.update_status(None, Duration::from_secs(2)).await.unwrap();
    let first = fps.status();

    fps.stop_trajectory(false).await.unwrap();
    fps.update_status(None, Duration::from_secs(2)).await.unwrap();
    assert_eq!(fps.status(), first);

    fps.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_goto_rejects_negative_absolute_angles() {
    let registry = FpsRegistry::new();
    let (_bus, interfaces) = virtual_fleet(2, 1.0);
    let fps = Fps::create(&registry, test_config("negative"), interfaces)
        .await
        .unwrap();

    let err = fps
        .goto(HashMap::from([(1, (-5.0, 180.0))]), None, false)
        .await
        .unwrap_err();
    assert!(matches!(err, JaegerError::Usage(_)));

    fps.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_goto_all_disabled_is_a_noop_success() {
    let registry = FpsRegistry::new();
    let (_bus, interfaces) = virtual_fleet(2, 1.0);
    let mut config = test_config("all-disabled");
    config.fps.disabled_positioners = vec![1, 2];
    let fps = Fps::create(&registry, config, interfaces).await.unwrap();

    fps.goto(HashMap::from([(1, (90.0, 90.0)), (2, (10.0, 10.0))]), None, false)
        .await
        .unwrap();

    // Nothing moved.
    let p1 = fps.positioner(1).await.unwrap();
    assert!(p1.alpha.is_none() || p1.alpha.unwrap().abs() < 1e-3);

    fps.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_update_position_with_nothing_initialised_is_empty() {
    let registry = FpsRegistry::new();
    let (_bus, interfaces) = virtual_fleet(2, 1.0);
    let fps = Fps::new(&registry, test_config("empty-positions"), interfaces).unwrap();
    fps.start_can().unwrap();

    let positions = fps
        .update_position(None, Duration::from_secs(1))
        .await
        .unwrap();
    assert!(positions.is_empty());

    fps.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_set_position_range_checks() {
    let registry = FpsRegistry::new();
    let (_bus, interfaces) = virtual_fleet(1, 1.0);
    let fps = Fps::create(&registry, test_config("set-position"), interfaces)
        .await
        .unwrap();

    let err = fps.set_position(1, 360.0, 10.0).await.unwrap_err();
    assert!(matches!(err, JaegerError::Usage(_)));

    fps.set_position(1, 12.5, 181.25).await.unwrap();
    let p1 = fps.positioner(1).await.unwrap();
    assert!((p1.alpha.unwrap() - 12.5).abs() < 1e-3);
    assert!((p1.beta.unwrap() - 181.25).abs() < 1e-3);

    fps.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_offline_positioners_are_inserted_disabled() {
    let registry = FpsRegistry::new();
    let (_bus, interfaces) = virtual_fleet(3, 1.0);
    let mut config = test_config("offline");
    config.fps.offline_positioners = HashMap::from([(7, (12.0, 180.0))]);
    let fps = Fps::create(&registry, config, interfaces).await.unwrap();

    assert_eq!(fps.n_positioners().await, 4);
    let p7 = fps.positioner(7).await.unwrap();
    assert!(p7.disabled);
    assert!(p7.offline);
    assert!((p7.alpha.unwrap() - 12.0).abs() < 1e-3);
    assert!((p7.beta.unwrap() - 180.0).abs() < 1e-3);

    // Fleet status ignores the offline positioner.
    assert_eq!(fps.status(), FPSStatus::IDLE | FPSStatus::TEMPERATURE_NORMAL);

    fps.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_disabled_positioner_rejects_unsafe_commands() {
    let registry = FpsRegistry::new();
    let (_bus, interfaces) = virtual_fleet(3, 1.0);
    let mut config = test_config("disabled");
    config.fps.disabled_positioners = vec![2];
    let fps = Fps::create(&registry, config, interfaces).await.unwrap();

    let err = fps
        .send_command(
            Command::new(CommandID::SetSpeed, vec![2])
                .with_data(commands::speed_payload(1000, 1000)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, JaegerError::DisabledInvolved { .. }));

    // Safe commands still go through.
    let command = fps
        .send_command(Command::new(CommandID::GetStatus, vec![2]))
        .await
        .unwrap();
    assert_eq!(command.wait().await, CommandStatus::Done);

    fps.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unknown_positioner_rejected() {
    let registry = FpsRegistry::new();
    let (_bus, interfaces) = virtual_fleet(2, 1.0);
    let fps = Fps::create(&registry, test_config("unknown"), interfaces)
        .await
        .unwrap();

    let err = fps
        .send_command(Command::new(CommandID::GetStatus, vec![99]))
        .await
        .unwrap_err();
    assert!(matches!(err, JaegerError::UnknownPositioner { id: 99 }));

    fps.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_pollers_start_and_stop_with_fleet() {
    let registry = FpsRegistry::new();
    let (_bus, interfaces) = virtual_fleet(2, 1.0);
    let mut config = test_config("pollers");
    config.fps.start_pollers = true;
    config.fps.status_poller_delay = 0.1;
    config.fps.position_poller_delay = 0.1;
    let fps = Fps::create(&registry, config, interfaces).await.unwrap();

    assert!(fps.pollers().running());

    // A few iterations refresh positions without intervention.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let p1 = fps.positioner(1).await.unwrap();
    assert!(p1.alpha.is_some());

    fps.shutdown().await.unwrap();
    assert!(!fps.pollers().running());
}
