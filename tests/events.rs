//! Device event subscriptions.

mod common;

use common::eventually;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use vmbx::{AllocationMode, VmbError};
use vmbx_core::event::EventOccurrence;

const APP: AllocationMode = AllocationMode::ApplicationAllocates;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_acquisition_start_raised_once_per_start() {
    let system = common::system();
    let camera = common::open(&system, "DEV_A").await;

    let seen: Arc<Mutex<Vec<EventOccurrence>>> = Arc::new(Mutex::new(Vec::new()));
    let _subscription = {
        let seen = Arc::clone(&seen);
        camera
            .subscribe_event("EventAcquisitionStart", move |event| seen.lock().push(event.clone()))
            .unwrap()
    };
    assert_eq!(camera.events().subscriber_count("AcquisitionStart"), 1);

    let capture = camera.prepare_capture(APP, 2).await.unwrap();
    for run in 1..=2usize {
        capture.start().await.unwrap();
        assert!(eventually(|| seen.lock().len() == run).await);
        capture.stop().await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let seen = seen.lock().clone();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].feature, "EventAcquisitionStart");
    assert_eq!(seen[0].category, "AcquisitionStart");
    assert_eq!((seen[0].sequence, seen[1].sequence), (1, 2));
    assert_eq!(
        camera.features().read_int("EventAcquisitionStart").unwrap(),
        seen[1].event_id as i64
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_every_subscriber_sees_the_event() {
    let system = common::system();
    let camera = common::open(&system, "DEV_A").await;

    let counts: Vec<Arc<AtomicU64>> = (0..2).map(|_| Arc::new(AtomicU64::new(0))).collect();
    let ends = Arc::new(AtomicU64::new(0));
    let mut subscriptions = Vec::new();
    for count in &counts {
        let count = Arc::clone(count);
        subscriptions.push(
            camera
                .subscribe_event("EventAcquisitionStart", move |_| {
                    count.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap(),
        );
    }
    {
        let ends = Arc::clone(&ends);
        subscriptions.push(
            camera
                .subscribe_event("EventAcquisitionEnd", move |_| {
                    ends.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap(),
        );
    }

    let capture = camera.prepare_capture(APP, 2).await.unwrap();
    capture.start().await.unwrap();
    capture.stop().await.unwrap();

    assert!(eventually(|| counts.iter().all(|c| c.load(Ordering::SeqCst) == 1)).await);
    assert!(eventually(|| ends.load(Ordering::SeqCst) == 1).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dropped_subscription_stops_delivery() {
    let system = common::system();
    let camera = common::open(&system, "DEV_A").await;

    let count = Arc::new(AtomicU64::new(0));
    let subscription = {
        let count = Arc::clone(&count);
        camera
            .subscribe_event("EventAcquisitionStart", move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap()
    };
    assert_eq!(subscription.category(), "AcquisitionStart");
    subscription.unsubscribe();
    assert_eq!(camera.events().subscriber_count("AcquisitionStart"), 0);

    let capture = camera.prepare_capture(APP, 2).await.unwrap();
    capture.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    capture.stop().await.unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unknown_event_feature() {
    let system = common::system();
    let camera = common::open(&system, "DEV_A").await;
    assert!(matches!(
        camera.subscribe_event("EventNoSuchThing", |_| {}),
        Err(VmbError::NotFound(_))
    ));
    assert!(matches!(
        camera.subscribe_event("Width", |_| {}),
        Err(VmbError::NotFound(_))
    ));

    let categories = camera.events().categories().unwrap();
    assert!(categories.contains(&"AcquisitionStart".to_string()));
    assert!(categories.contains(&"AcquisitionEnd".to_string()));
}

#[tokio::test]
async fn test_closed_camera_refuses_subscriptions() {
    let system = common::system();
    let camera = common::open(&system, "DEV_A").await;
    camera.close().await.unwrap();
    assert!(matches!(
        camera.subscribe_event("EventAcquisitionStart", |_| {}),
        Err(VmbError::InvalidState(_))
    ));
}
