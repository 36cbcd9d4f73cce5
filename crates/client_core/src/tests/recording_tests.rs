use std::time::Duration;

use tokio::{
    sync::{mpsc, oneshot},
    time::Instant,
};

use super::*;

const MIME: &str = "audio/webm;codecs=opus";

fn capturing(now: Instant) -> RecordingController {
    let mut controller = RecordingController::new();
    assert!(controller.request_start());
    assert_eq!(controller.on_acquired(now, MIME), AcquireOutcome::Capture);
    controller
}

#[test]
fn stop_with_audio_produces_an_upload() {
    let t0 = Instant::now();
    let mut controller = capturing(t0);
    controller.on_fragment(vec![1, 2]);
    controller.on_fragment(Vec::new());
    controller.on_fragment(vec![3]);

    assert!(controller.stop());
    assert_eq!(controller.state(), RecordingState::Stopping);
    controller.on_fragment(vec![4]);

    let finalized = controller.on_device_stopped(t0 + Duration::from_millis(2_600));
    assert_eq!(
        finalized,
        Finalized::Upload(VoiceClip {
            bytes: vec![1, 2, 3, 4],
            mime_type: MIME.to_string(),
            duration_seconds: 3,
        })
    );
    assert_eq!(controller.state(), RecordingState::Uploading);

    controller.on_upload_finished();
    assert_eq!(controller.state(), RecordingState::Idle);
}

#[test]
fn cancel_before_any_fragment_ends_cancelled_without_upload() {
    let t0 = Instant::now();
    let mut controller = capturing(t0);

    assert!(controller.cancel());
    assert_eq!(controller.state(), RecordingState::Stopping);
    assert_eq!(
        controller.on_device_stopped(t0 + Duration::from_secs(1)),
        Finalized::Discarded
    );
    assert_eq!(controller.state(), RecordingState::Cancelled);
}

#[test]
fn cancel_racing_a_pending_stop_still_discards() {
    let t0 = Instant::now();
    let mut controller = capturing(t0);
    controller.on_fragment(vec![9; 16]);

    assert!(controller.stop());
    assert!(!controller.cancel());
    assert_eq!(
        controller.on_device_stopped(t0 + Duration::from_secs(4)),
        Finalized::Discarded
    );
    assert_eq!(controller.state(), RecordingState::Cancelled);
}

#[test]
fn cancel_during_acquisition_cancels_once_the_device_opens() {
    let mut controller = RecordingController::new();
    assert!(controller.request_start());
    assert!(!controller.request_start());
    assert!(!controller.cancel());

    assert_eq!(
        controller.on_acquired(Instant::now(), MIME),
        AcquireOutcome::Release
    );
    assert_eq!(controller.state(), RecordingState::Cancelled);
    assert!(!controller.is_acquiring());
}

#[test]
fn stop_during_acquisition_stops_as_soon_as_the_device_opens() {
    let t0 = Instant::now();
    let mut controller = RecordingController::new();
    assert!(controller.request_start());
    assert!(!controller.stop());
    assert_eq!(controller.state(), RecordingState::Idle);

    assert_eq!(controller.on_acquired(t0, MIME), AcquireOutcome::Stop);
    assert_eq!(controller.state(), RecordingState::Stopping);
    assert_eq!(controller.elapsed(t0 + Duration::from_secs(1)), None);

    controller.on_fragment(vec![5]);
    assert!(matches!(
        controller.on_device_stopped(t0 + Duration::from_millis(300)),
        Finalized::Upload(VoiceClip { ref bytes, .. }) if bytes == &vec![5]
    ));
}

#[test]
fn stop_then_cancel_during_acquisition_still_cancels() {
    let mut controller = RecordingController::new();
    controller.request_start();
    controller.stop();
    controller.cancel();
    assert_eq!(
        controller.on_acquired(Instant::now(), MIME),
        AcquireOutcome::Release
    );
    assert_eq!(controller.state(), RecordingState::Cancelled);

    assert!(controller.request_start());
    assert_eq!(
        controller.on_acquired(Instant::now(), MIME),
        AcquireOutcome::Capture
    );
}

#[test]
fn empty_device_mime_falls_back_to_default() {
    let t0 = Instant::now();
    let mut controller = RecordingController::new();
    controller.request_start();
    controller.on_acquired(t0, " ");
    controller.on_fragment(vec![1]);
    controller.stop();
    let Finalized::Upload(clip) = controller.on_device_stopped(t0) else {
        panic!("expected upload");
    };
    assert_eq!(clip.mime_type, DEFAULT_CAPTURE_MIME);
}

#[test]
fn start_is_ignored_while_a_session_is_busy() {
    let t0 = Instant::now();
    let mut controller = capturing(t0);
    assert!(!controller.request_start());

    controller.on_fragment(vec![1]);
    controller.stop();
    assert!(!controller.request_start());

    controller.on_device_stopped(t0 + Duration::from_secs(1));
    assert_eq!(controller.state(), RecordingState::Uploading);
    assert!(!controller.request_start());
}

#[test]
fn a_new_session_can_start_after_cancel_and_clears_the_discard_flag() {
    let t0 = Instant::now();
    let mut controller = capturing(t0);
    controller.cancel();
    controller.on_device_stopped(t0);
    assert_eq!(controller.state(), RecordingState::Cancelled);

    assert!(controller.request_start());
    assert_eq!(controller.on_acquired(t0, MIME), AcquireOutcome::Capture);
    controller.on_fragment(vec![7]);
    controller.stop();
    assert!(matches!(
        controller.on_device_stopped(t0 + Duration::from_millis(400)),
        Finalized::Upload(VoiceClip {
            duration_seconds: 0,
            ..
        })
    ));
}

#[test]
fn permission_denied_leaves_state_untouched() {
    let mut controller = RecordingController::new();
    assert!(controller.request_start());
    controller.on_permission_denied();
    assert_eq!(controller.state(), RecordingState::Idle);
    assert!(!controller.is_acquiring());
    assert!(controller.request_start());
}

#[test]
fn stopping_without_audio_returns_to_idle() {
    let t0 = Instant::now();
    let mut controller = capturing(t0);
    controller.stop();
    assert_eq!(controller.on_device_stopped(t0), Finalized::Empty);
    assert_eq!(controller.state(), RecordingState::Idle);
}

#[test]
fn stray_callbacks_are_ignored() {
    let mut controller = RecordingController::new();
    controller.on_fragment(vec![1, 2, 3]);
    assert!(!controller.stop());
    assert!(!controller.cancel());
    assert_eq!(controller.on_device_stopped(Instant::now()), Finalized::Ignored);
    assert_eq!(controller.state(), RecordingState::Idle);
}

#[test]
fn elapsed_is_reported_only_while_capturing() {
    let t0 = Instant::now();
    let mut controller = capturing(t0);
    assert_eq!(
        controller.elapsed(t0 + Duration::from_secs(5)),
        Some(Duration::from_secs(5))
    );
    controller.stop();
    assert_eq!(controller.elapsed(t0 + Duration::from_secs(6)), None);
}

#[tokio::test]
async fn capture_stream_closes_after_stop_request() {
    let (fragment_tx, fragment_rx) = mpsc::channel(4);
    let (stop_tx, stop_rx) = oneshot::channel();
    let device = tokio::spawn(async move {
        fragment_tx.send(vec![1]).await.expect("send");
        let _ = stop_rx.await;
        fragment_tx.send(vec![2]).await.expect("flush");
    });

    let mut stream = CaptureStream::new(fragment_rx, stop_tx, "audio/ogg");
    assert_eq!(stream.mime_type(), "audio/ogg");
    assert_eq!(stream.next_fragment().await, Some(vec![1]));
    stream.request_stop();
    stream.request_stop();
    assert_eq!(stream.next_fragment().await, Some(vec![2]));
    assert_eq!(stream.next_fragment().await, None);
    device.await.expect("device task");
}

#[tokio::test]
async fn missing_audio_source_denies_permission() {
    let err = MissingAudioSource.open().await.err().expect("must fail");
    assert!(err.reason.contains("no audio capture device"));
}
