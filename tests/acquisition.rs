//! Acquisition engine against the simulated platform.

mod common;

use common::{eventually, WAIT};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use vmbx::recorder::{FrameRecorder, FrameWriter};
use vmbx::setup;
use vmbx::{AllocationMode, CaptureOptions, EngineState, System, VmbError};
use vmbx_core::frame::FrameStatus;
use vmbx_core::module::InterfaceKind;
use vmbx_sim::{ErrorConfig, ErrorScenario, SimCameraConfig, SimTransport};

const APP: AllocationMode = AllocationMode::ApplicationAllocates;

// =============================================================================
// Pull mode
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pull_mode_delivers_in_order() {
    let system = common::system();
    let camera = common::open(&system, "DEV_A").await;
    let capture = camera.prepare_capture(APP, 3).await.unwrap();
    assert_eq!(capture.state(), EngineState::Prepared);
    assert_eq!(capture.buffer_count(), 3);

    capture.start().await.unwrap();
    for expected in 1..=6u64 {
        let frame = capture.wait_for_frame(WAIT).await.unwrap();
        assert_eq!(frame.id(), expected);
        assert_eq!(frame.status(), FrameStatus::Completed);
        assert_eq!((frame.width(), frame.height()), (64, 48));
    }
    capture.stop().await.unwrap();

    let stats = capture.statistics();
    assert_eq!(stats.delivered, 6);
    assert_eq!(stats.lost, 0);
    assert_eq!(stats.last_frame_id, Some(6));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_restart_numbers_frames_from_one() {
    let system = common::system();
    let camera = common::open(&system, "DEV_A").await;
    let capture = camera.prepare_capture(APP, 3).await.unwrap();

    for _ in 0..2 {
        capture.start().await.unwrap();
        let ids: Vec<u64> = {
            let mut ids = Vec::new();
            for _ in 0..3 {
                ids.push(capture.wait_for_frame(WAIT).await.unwrap().id());
            }
            ids
        };
        assert_eq!(ids, vec![1, 2, 3]);
        capture.stop().await.unwrap();
        assert_eq!(capture.state(), EngineState::Prepared);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_exhausted_pool_stalls_until_requeue() {
    let system = common::system();
    let camera = common::open(&system, "DEV_A").await;
    let capture = camera.prepare_capture(APP, 2).await.unwrap();
    capture.start().await.unwrap();

    let first = capture.wait_for_frame(WAIT).await.unwrap();
    let second = capture.wait_for_frame(WAIT).await.unwrap();
    assert_eq!((first.id(), second.id()), (1, 2));

    // Both buffers are on loan: capture stalls instead of failing.
    let stalled = capture.wait_for_frame(Duration::from_millis(100)).await;
    assert!(matches!(stalled, Err(VmbError::Timeout(_))));
    assert!(capture.outstanding() <= 2);

    first.release();
    let third = capture.wait_for_frame(WAIT).await.unwrap();
    assert_eq!(third.id(), 3);
    drop(second);
    drop(third);
    capture.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_aborts_pending_wait() {
    let system = common::system();
    let camera = common::open(&system, "DEV_A").await;
    setup::set_software_trigger(&camera.features()).unwrap();
    let capture = Arc::new(camera.prepare_capture(APP, 2).await.unwrap());
    capture.start().await.unwrap();

    let waiter = {
        let capture = Arc::clone(&capture);
        tokio::spawn(async move { capture.wait_for_frame(Duration::from_secs(30)).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    capture.stop().await.unwrap();

    let result = tokio::time::timeout(WAIT, waiter).await.unwrap().unwrap();
    assert!(matches!(result, Err(VmbError::Aborted)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_software_trigger_paces_frames() {
    let system = common::system();
    let camera = common::open(&system, "DEV_A").await;
    setup::set_software_trigger(&camera.features()).unwrap();
    let capture = camera.prepare_capture(APP, 2).await.unwrap();
    capture.start().await.unwrap();

    let idle = capture.wait_for_frame(Duration::from_millis(100)).await;
    assert!(matches!(idle, Err(VmbError::Timeout(_))));

    camera.run_command("TriggerSoftware").unwrap();
    let frame = capture.wait_for_frame(WAIT).await.unwrap();
    assert_eq!(frame.id(), 1);
    drop(frame);
    capture.stop().await.unwrap();
}

// =============================================================================
// Push mode
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_callback_receives_each_frame_once_in_order() {
    let system = common::system();
    let camera = common::open(&system, "DEV_A").await;
    let capture = camera.prepare_capture(APP, 3).await.unwrap();

    let ids = Arc::new(Mutex::new(Vec::new()));
    {
        let ids = Arc::clone(&ids);
        capture
            .register_frame_callback(move |frame| {
                ids.lock().push(frame.id());
                Ok(())
            })
            .unwrap();
    }
    capture.start().await.unwrap();
    assert!(eventually(|| ids.lock().len() >= 20).await);
    capture.stop().await.unwrap();

    let seen = ids.lock().clone();
    let expected: Vec<u64> = (1..=seen.len() as u64).collect();
    assert_eq!(seen, expected);
    assert_eq!(capture.statistics().delivered, seen.len() as u64);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(ids.lock().len(), seen.len());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failing_callback_still_requeues() {
    let system = common::system();
    let camera = common::open(&system, "DEV_A").await;
    let capture = camera.prepare_capture(APP, 2).await.unwrap();

    let calls = Arc::new(AtomicU64::new(0));
    {
        let calls = Arc::clone(&calls);
        capture
            .register_frame_callback(move |_frame| {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(VmbError::InvalidState("consumer rejected frame".into()))
            })
            .unwrap();
    }
    capture.start().await.unwrap();
    // More frames than buffers: every failed callback gave its buffer back.
    assert!(eventually(|| calls.load(Ordering::SeqCst) >= 10).await);
    capture.stop().await.unwrap();

    let stats = capture.statistics();
    assert_eq!(stats.callback_failures, stats.delivered);
    assert_eq!(capture.outstanding(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_panicking_callback_does_not_stop_delivery() {
    let system = common::system();
    let camera = common::open(&system, "DEV_A").await;
    let capture = camera.prepare_capture(APP, 2).await.unwrap();

    let calls = Arc::new(AtomicU64::new(0));
    {
        let calls = Arc::clone(&calls);
        capture
            .register_frame_callback(move |frame| {
                calls.fetch_add(1, Ordering::SeqCst);
                if frame.id() == 1 {
                    panic!("first frame");
                }
                Ok(())
            })
            .unwrap();
    }
    capture.start().await.unwrap();
    assert!(eventually(|| calls.load(Ordering::SeqCst) >= 5).await);
    capture.stop().await.unwrap();
    assert_eq!(capture.statistics().callback_failures, 1);
    assert_eq!(capture.outstanding(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_waits_for_callbacks_in_flight() {
    let system = common::system();
    let camera = common::open(&system, "DEV_A").await;
    let stream = camera.open_stream(0).await.unwrap();
    let options = CaptureOptions {
        delivery_workers: 2,
        ..CaptureOptions::default()
    };
    let capture = stream.prepare_capture_with(APP, 4, options).await.unwrap();

    let entered = Arc::new(AtomicU64::new(0));
    let finished = Arc::new(AtomicU64::new(0));
    {
        let entered = Arc::clone(&entered);
        let finished = Arc::clone(&finished);
        capture
            .register_frame_callback(move |_frame| {
                entered.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(150));
                finished.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
    }
    capture.start().await.unwrap();
    assert!(eventually(|| entered.load(Ordering::SeqCst) >= 1).await);

    capture.stop().await.unwrap();
    assert_eq!(entered.load(Ordering::SeqCst), finished.load(Ordering::SeqCst));
    assert_eq!(capture.outstanding(), 4);

    capture.end_capture().await.unwrap();
    assert_eq!(capture.buffer_count(), 0);
}

#[tokio::test]
async fn test_callback_rules() {
    let system = common::system();
    let camera = common::open(&system, "DEV_A").await;
    let capture = camera.prepare_capture(APP, 2).await.unwrap();

    // Not acquiring yet.
    assert!(matches!(
        capture.wait_for_frame(Duration::from_millis(10)).await,
        Err(VmbError::InvalidState(_))
    ));

    capture.register_frame_callback(|_frame| Ok(())).unwrap();
    capture.start().await.unwrap();
    assert!(matches!(
        capture.wait_for_frame(Duration::from_millis(10)).await,
        Err(VmbError::InvalidState(_))
    ));
    assert!(matches!(
        capture.register_frame_callback(|_frame| Ok(())),
        Err(VmbError::InvalidState(_))
    ));
    assert!(capture.unregister_frame_callback().is_err());

    capture.stop().await.unwrap();
    assert!(capture.unregister_frame_callback().unwrap());
    assert!(!capture.unregister_frame_callback().unwrap());
}

// =============================================================================
// State machine and allocation
// =============================================================================

#[tokio::test]
async fn test_state_machine() {
    let system = common::system();
    let camera = common::open(&system, "DEV_A").await;
    let stream = camera.open_stream(0).await.unwrap();

    assert!(matches!(
        stream.prepare_capture(APP, 0).await,
        Err(VmbError::AllocationError(_))
    ));

    let capture = stream.prepare_capture(APP, 2).await.unwrap();
    assert!(matches!(
        capture.prepare(APP, 2).await,
        Err(VmbError::InvalidState(_))
    ));
    capture.stop().await.unwrap();
    assert_eq!(capture.state(), EngineState::Prepared);

    capture.start().await.unwrap();
    assert_eq!(capture.state(), EngineState::Acquiring);
    assert!(matches!(capture.start().await, Err(VmbError::InvalidState(_))));

    capture.end_capture().await.unwrap();
    assert_eq!(capture.state(), EngineState::Idle);
    assert!(matches!(capture.start().await, Err(VmbError::InvalidState(_))));

    // The same session can be prepared again.
    capture
        .prepare(AllocationMode::TransportAllocates, 3)
        .await
        .unwrap();
    assert_eq!(
        capture.allocation_mode(),
        Some(AllocationMode::TransportAllocates)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_transport_allocated_buffers() {
    let system = common::system();
    let camera = common::open(&system, "DEV_A").await;
    let capture = camera
        .prepare_capture(AllocationMode::TransportAllocates, 3)
        .await
        .unwrap();
    capture.start().await.unwrap();
    for expected in 1..=5u64 {
        assert_eq!(capture.wait_for_frame(WAIT).await.unwrap().id(), expected);
    }
    capture.stop().await.unwrap();
}

#[tokio::test]
async fn test_transport_allocation_failure() {
    let transport = SimTransport::new(common::cameras()).with_errors(
        "DEV_A",
        ErrorConfig::scenario(ErrorScenario::Timeout {
            operation: "allocate_buffers",
        }),
    );
    let system = common::system_on(transport);
    let camera = common::open(&system, "DEV_A").await;
    let stream = camera.open_stream(0).await.unwrap();
    let result = stream
        .prepare_capture(AllocationMode::TransportAllocates, 3)
        .await;
    assert!(matches!(result, Err(VmbError::AllocationError(_))));

    // Application buffers do not involve the transport.
    assert!(stream.prepare_capture(APP, 3).await.is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_start_stays_prepared() {
    let transport = SimTransport::new(common::cameras()).with_errors(
        "DEV_A",
        ErrorConfig::scenario(ErrorScenario::FailAfterN {
            operation: "AcquisitionStart",
            count: 1,
        }),
    );
    let system = common::system_on(transport);
    let camera = common::open(&system, "DEV_A").await;
    let capture = camera.prepare_capture(APP, 2).await.unwrap();

    capture.start().await.unwrap();
    capture.stop().await.unwrap();

    assert!(matches!(capture.start().await, Err(VmbError::Device(_))));
    assert_eq!(capture.state(), EngineState::Prepared);
    assert_eq!(capture.outstanding(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_camera_capture_releases_its_stream() {
    let system = common::system();
    let camera = common::open(&system, "DEV_A").await;

    let capture = camera.prepare_capture(APP, 2).await.unwrap();
    capture.start().await.unwrap();
    assert_eq!(capture.wait_for_frame(WAIT).await.unwrap().id(), 1);
    capture.end_capture().await.unwrap();
    drop(capture);

    let capture = camera.prepare_capture(APP, 2).await.unwrap();
    capture.end_capture().await.unwrap();
    // The stream went with the session.
    assert!(matches!(
        capture.prepare(APP, 2).await,
        Err(VmbError::InvalidState(_))
    ));

    // Without dropping the earlier handle.
    let again = camera.prepare_capture(APP, 2).await.unwrap();
    assert_eq!(again.state(), EngineState::Prepared);
}

#[tokio::test]
async fn test_failed_camera_prepare_closes_stream() {
    let system = common::system();
    let camera = common::open(&system, "DEV_A").await;
    assert!(matches!(
        camera.prepare_capture(APP, 0).await,
        Err(VmbError::AllocationError(_))
    ));
    let capture = camera.prepare_capture(APP, 2).await.unwrap();
    assert_eq!(capture.buffer_count(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_recorded_frames_land_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = FrameRecorder::spawn(FrameWriter::create(dir.path()).unwrap());
    let system = common::system();
    let camera = common::open(&system, "DEV_A").await;
    let capture = camera.prepare_capture(APP, 3).await.unwrap();

    let recorded = Arc::new(AtomicU64::new(0));
    {
        let recorded = Arc::clone(&recorded);
        let sink = recorder.sink();
        capture
            .register_frame_callback(move |frame| {
                if sink.record(&frame) {
                    recorded.fetch_add(1, Ordering::SeqCst);
                }
                Ok(())
            })
            .unwrap();
    }
    capture.start().await.unwrap();
    assert!(eventually(|| recorded.load(Ordering::SeqCst) >= 3).await);
    capture.stop().await.unwrap();
    assert!(capture.unregister_frame_callback().unwrap());

    let written = recorder.finish().await.unwrap();
    assert_eq!(written, recorded.load(Ordering::SeqCst));
    for id in 1..=3 {
        let image = std::fs::read(dir.path().join(format!("frame_{:06}.raw", id))).unwrap();
        assert_eq!(image.len(), 64 * 48);
    }
}

// =============================================================================
// Frame status and chunks
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_incomplete_frames_are_delivered_without_chunks() {
    let camera_config = SimCameraConfig {
        incomplete_rate: 1.0,
        ..SimCameraConfig::small("DEV_I", InterfaceKind::Usb)
    };
    let system = System::startup_with(
        Arc::new(SimTransport::new(vec![camera_config])),
        common::config(),
    )
    .unwrap();
    let camera = common::open(&system, "DEV_I").await;
    setup::enable_chunks(&camera.features(), &["Width".to_string()]).unwrap();

    let stream = camera.open_stream(0).await.unwrap();
    let options = CaptureOptions {
        decode_chunks: true,
        ..CaptureOptions::default()
    };
    let capture = stream.prepare_capture_with(APP, 2, options).await.unwrap();
    capture.start().await.unwrap();
    for _ in 0..3 {
        let frame = capture.wait_for_frame(WAIT).await.unwrap();
        assert_eq!(frame.status(), FrameStatus::Incomplete);
        assert!(matches!(frame.chunks(), Err(VmbError::InvalidState(_))));
    }
    capture.stop().await.unwrap();

    let stats = capture.statistics();
    assert_eq!(stats.incomplete, 3);
    assert_eq!(stats.completed, 0);
    assert_eq!(stats.chunk_errors, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_chunks_decoded_for_completed_frames() {
    let system = common::system();
    let camera = common::open(&system, "DEV_A").await;
    setup::enable_chunks(
        &camera.features(),
        &["Width".to_string(), "FrameID".to_string(), "ExposureTime".to_string()],
    )
    .unwrap();

    let stream = camera.open_stream(0).await.unwrap();
    let options = CaptureOptions {
        decode_chunks: true,
        ..CaptureOptions::default()
    };
    let capture = stream.prepare_capture_with(APP, 3, options).await.unwrap();
    capture.start().await.unwrap();
    for _ in 0..3 {
        let frame = capture.wait_for_frame(WAIT).await.unwrap();
        let chunks = frame.chunks().unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.read_int("ChunkWidth").unwrap(), 64);
        assert_eq!(chunks.read_int("ChunkFrameID").unwrap(), frame.id() as i64);
        assert_eq!(chunks.read_float("ChunkExposureTime").unwrap(), 5_000.0);
        assert!(chunks.read_int("ChunkHeight").is_err());
    }
    capture.stop().await.unwrap();
    assert_eq!(capture.statistics().chunk_errors, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_frames_without_chunk_mode_have_no_chunk_data() {
    let system = common::system();
    let camera = common::open(&system, "DEV_A").await;
    setup::enable_chunks(&camera.features(), &[]).unwrap();

    let stream = camera.open_stream(0).await.unwrap();
    let options = CaptureOptions {
        decode_chunks: true,
        ..CaptureOptions::default()
    };
    let capture = stream.prepare_capture_with(APP, 2, options).await.unwrap();
    capture.start().await.unwrap();
    let frame = capture.wait_for_frame(WAIT).await.unwrap();
    assert!(!frame.has_chunk_data());
    assert!(matches!(frame.chunks(), Err(VmbError::NoChunkData)));
    drop(frame);
    capture.stop().await.unwrap();
}
