use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use argus::capture::SyntheticSource;
use argus::detection::{DetectionController, MockDetector, MockOptions};
use argus::display::{Compositor, OverlayTag};
use argus::motion::MotionController;
use argus::pipeline::{FrameQueues, PlaybackController, PlaybackEvent, StopFlag};
use argus::Config;

const FRAMES: u64 = 30;

fn start_mock() -> (u16, StopFlag, thread::JoinHandle<()>) {
    let detector = MockDetector::bind("127.0.0.1:0", MockOptions::default()).unwrap();
    let port = detector.local_addr().unwrap().port();
    let stop = StopFlag::new();
    let handle = {
        let stop = stop.clone();
        thread::spawn(move || detector.serve(stop))
    };
    (port, stop, handle)
}

#[test]
fn frames_are_composited_with_remote_detections() {
    let (port, server_stop, server) = start_mock();

    let mut config = Config::default();
    config.detection.host = "127.0.0.1".into();
    config.detection.port = port;
    config.detection.backoff_ms = 200;
    config.playback.tick_ms = 5;
    config.playback.motion_enabled = true;

    let queues = FrameQueues::new(config.queues.frame_capacity);
    let mut playback =
        PlaybackController::spawn(&config.playback, queues.clone(), config.queues.event_capacity).unwrap();
    let mut detection = DetectionController::spawn(
        &config.detection,
        Arc::clone(&queues.detection),
        config.queues.event_capacity,
    )
    .unwrap();
    let mut motion = MotionController::spawn(
        &config.motion,
        Arc::clone(&queues.motion),
        config.queues.motion_result_capacity,
    )
    .unwrap();
    let mut compositor = Compositor::new(&config.compositor, Arc::clone(&queues.display)).unwrap();

    playback.open(Box::new(SyntheticSource::new(160, 120, FRAMES, 30.0)));
    playback.play();

    let expected_results = FRAMES.div_ceil(config.playback.decimation) as usize;
    let mut shown = BTreeSet::new();
    let mut finished = false;
    let mut motion_frames = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(15);

    while Instant::now() < deadline {
        finished |= playback.events().try_iter().any(|e| e == PlaybackEvent::Finished);
        if let Some(composited) = compositor.tick(detection.events()) {
            shown.insert(composited.frame_id);
        }
        while let Some(result) = motion.results().try_pop() {
            motion_frames.push(result.frame_id);
        }
        if finished && shown.len() as u64 == FRAMES && compositor.cache().len() == expected_results {
            break;
        }
        thread::sleep(Duration::from_millis(2));
    }

    assert!(finished, "playback should reach end of stream");
    assert_eq!(shown, (0..FRAMES).collect::<BTreeSet<_>>());

    assert_eq!(compositor.cache().len(), expected_results);
    for id in (0..FRAMES).step_by(config.playback.decimation as usize) {
        let result = compositor.cache().get(id).expect("result for sampled frame");
        assert_eq!(result.detections.len(), 1);
        assert_eq!(result.detections[0].label, "person");
    }
    assert_eq!(compositor.total_detections(), expected_results);

    // Last shown frame (29) reuses the result for frame 27
    let last = compositor.redraw().expect("current frame");
    assert_eq!(last.frame_id, FRAMES - 1);
    assert_eq!(last.tag, Some(OverlayTag::Age(2)));
    assert_eq!(last.labels, vec!["person 90%".to_string()]);

    let live = compositor.select(27).expect("frame 27 has its own result");
    assert_eq!(live.tag, OverlayTag::Live);

    assert!(!motion_frames.is_empty(), "moving square should trigger motion");
    assert!(!motion_frames.contains(&0), "first frame only primes the reference");

    let timeout = config.shutdown.join_timeout();
    playback.shutdown(timeout);
    detection.shutdown(timeout);
    motion.shutdown(timeout);
    server_stop.stop();
    server.join().unwrap();

    let status = compositor.status().expect("client status reported");
    assert_eq!(status.errors, 0);
    assert_eq!(status.results_received as usize, expected_results);
}

#[test]
fn playback_continues_without_detection_service() {
    // Nothing listens on this port once the listener is dropped
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let mut config = Config::default();
    config.detection.host = "127.0.0.1".into();
    config.detection.port = port;
    config.detection.backoff_ms = 100;
    config.playback.tick_ms = 5;

    let queues = FrameQueues::new(config.queues.frame_capacity);
    let mut playback =
        PlaybackController::spawn(&config.playback, queues.clone(), config.queues.event_capacity).unwrap();
    let mut detection = DetectionController::spawn(
        &config.detection,
        Arc::clone(&queues.detection),
        config.queues.event_capacity,
    )
    .unwrap();
    let mut compositor = Compositor::new(&config.compositor, Arc::clone(&queues.display)).unwrap();

    playback.open(Box::new(SyntheticSource::new(64, 48, 20, 30.0)));
    playback.play();

    let mut shown = 0;
    let deadline = Instant::now() + Duration::from_secs(10);
    while shown < 20 && Instant::now() < deadline {
        if let Some(composited) = compositor.tick(detection.events()) {
            assert_eq!(composited.tag, None);
            shown += 1;
        }
        thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(shown, 20);

    thread::sleep(Duration::from_millis(300));
    compositor.tick(detection.events());
    let status = compositor.status().expect("client status reported");
    assert!(!status.is_connected());
    assert!(status.errors >= 1);

    let timeout = config.shutdown.join_timeout();
    playback.shutdown(timeout);
    detection.shutdown(timeout);
}
