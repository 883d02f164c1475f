use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
    mpsc::{self, Receiver, SyncSender, TrySendError},
};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::{config::PostProcessingConfig, pipeline::RenderPipeline, timing::FrameClock};

/// Cadence while the display is hidden: a fixed ~30 fps timer keeps the
/// session producing frames for a still-active call.
pub const HIDDEN_TICK_INTERVAL: Duration = Duration::from_millis(1000 / 30);

/// Default display-refresh pacing (60 Hz).
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_micros(16_667);

/// Host display visibility, as observed by the embedder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

/// Per-frame timing report: `(fps, stage durations in ms)`.
pub type TimingCallback = Box<dyn FnMut(f64, &[f64]) + Send>;

enum Event {
    Tick,
    UpdatePostProcessing(PostProcessingConfig),
    SetVisibility(Visibility),
    Stop,
}

/// A dedicated timing channel: a thread that does nothing but deliver
/// wake-up signals at a fixed interval. Pure signal carrier; it never
/// touches frame state. Ticks that arrive while a frame is still in
/// flight coalesce instead of queueing up.
struct Ticker {
    cancel: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Ticker {
    fn spawn(interval: Duration, events: SyncSender<Event>) -> Self {
        let cancel = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancel);
        let thread = std::thread::spawn(move || {
            loop {
                std::thread::sleep(interval);
                if flag.load(Ordering::Relaxed) {
                    break;
                }
                match events.try_send(Event::Tick) {
                    Ok(()) => {}
                    // Receiver busy mid-frame: drop the tick, the loop
                    // paces itself off the next one.
                    Err(TrySendError::Full(_)) => {}
                    Err(TrySendError::Disconnected(_)) => break,
                }
            }
        });
        Self {
            cancel,
            thread: Some(thread),
        }
    }

    fn cancel(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Drives the render loop: `Idle -> Running -> Stopping -> Idle`.
///
/// `start` transitions to Running on a dedicated render thread and issues
/// the first frame immediately. Each tick checks for termination, runs
/// exactly one `render`, updates the rolling fps estimate and reports
/// timings; at most one render is ever in flight. `stop` requests the
/// Stopping transition, cancels pending ticks, waits for the loop to run
/// `clean_up` exactly once, and returns with the scheduler Idle again.
pub struct FrameScheduler {
    refresh_interval: Duration,
}

impl Default for FrameScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameScheduler {
    pub fn new() -> Self {
        Self {
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
        }
    }

    /// Override display-refresh pacing (e.g. for 120 Hz displays or
    /// deterministic tests).
    pub fn with_refresh_interval(refresh_interval: Duration) -> Self {
        Self { refresh_interval }
    }

    pub fn start(
        self,
        pipeline: Box<dyn RenderPipeline>,
        callback: TimingCallback,
    ) -> RunningScheduler {
        // Capacity 1: a busy loop coalesces ticks instead of building a
        // backlog; control events use blocking send and simply wait for
        // the next drain.
        let (tx, rx) = mpsc::sync_channel::<Event>(1);
        let refresh = self.refresh_interval;
        let tick_tx = tx.clone();

        let thread = std::thread::spawn(move || {
            run_loop(pipeline, rx, tick_tx, refresh, callback);
        });

        tracing::info!("frame scheduler started");
        RunningScheduler {
            events: tx,
            thread: Some(thread),
        }
    }
}

/// Handle to a Running scheduler. Dropping it without calling
/// [`stop`](RunningScheduler::stop) stops the session as well.
pub struct RunningScheduler {
    events: SyncSender<Event>,
    thread: Option<JoinHandle<()>>,
}

impl RunningScheduler {
    /// Atomically replace the post-processing configuration; effective
    /// from the next frame.
    pub fn update_post_processing_config(&self, cfg: PostProcessingConfig) {
        let _ = self.events.send(Event::UpdatePostProcessing(cfg));
    }

    /// Report a visibility change; switches the tick source accordingly.
    pub fn set_visibility(&self, visibility: Visibility) {
        let _ = self.events.send(Event::SetVisibility(visibility));
    }

    /// Stop the session: no frame begins after this returns, and the
    /// pipeline's `clean_up` has run exactly once. Safe to call twice.
    pub fn stop(&mut self) {
        let Some(handle) = self.thread.take() else {
            return;
        };
        let _ = self.events.send(Event::Stop);
        let _ = handle.join();
        tracing::info!("frame scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }
}

impl Drop for RunningScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop(
    mut pipeline: Box<dyn RenderPipeline>,
    events: Receiver<Event>,
    tick_tx: SyncSender<Event>,
    refresh_interval: Duration,
    mut callback: TimingCallback,
) {
    let mut clock = FrameClock::new();
    let mut visibility = Visibility::Visible;
    let mut ticker = Ticker::spawn(refresh_interval, tick_tx.clone());

    // Running: the first frame is issued immediately, the rest are paced
    // by the active tick source.
    run_frame(pipeline.as_mut(), &mut clock, &mut callback);

    loop {
        match events.recv() {
            Ok(Event::Tick) => {
                run_frame(pipeline.as_mut(), &mut clock, &mut callback);
            }
            Ok(Event::UpdatePostProcessing(cfg)) => {
                // Applied between frames only; a frame in progress is
                // never altered.
                pipeline.update_post_processing_config(cfg);
            }
            Ok(Event::SetVisibility(next)) => {
                if next != visibility {
                    visibility = next;
                    let interval = match visibility {
                        Visibility::Visible => refresh_interval,
                        Visibility::Hidden => HIDDEN_TICK_INTERVAL,
                    };
                    tracing::debug!(?visibility, "switching tick source");
                    ticker.cancel();
                    ticker = Ticker::spawn(interval, tick_tx.clone());
                }
            }
            // Stopping: fall through to cleanup without running another
            // frame.
            Ok(Event::Stop) | Err(_) => break,
        }
    }

    ticker.cancel();
    pipeline.clean_up();
}

fn run_frame(pipeline: &mut dyn RenderPipeline, clock: &mut FrameClock, callback: &mut TimingCallback) {
    clock.begin_frame();
    if let Err(e) = pipeline.render(clock) {
        // Transient per-frame failures are not retried; the next tick
        // re-attempts naturally.
        tracing::warn!("frame render failed: {e}");
    }
    clock.end_frame();
    callback(clock.fps(), clock.stage_durations());
}
