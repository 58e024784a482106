use crate::error::Result;
use std::sync::{Arc, Mutex};

/// Receives processed frames from the Dispatch Stage.
///
/// Called once per frame, in frame order, from a single delivery context at a
/// time. Must not block indefinitely. Returning an error is logged and the
/// frame is counted as delivered; it never stalls frame production.
pub trait FrameListener: Send + 'static {
    /// Handle one processed frame (little-endian 16-bit PCM, whole frames).
    fn on_denoised_frame(&mut self, frame: &[u8]) -> Result<()>;

    /// Handle one chunk of raw input, mirrored from `push` when the original
    /// tap is enabled.
    fn on_original_frame(&mut self, _frame: &[u8]) -> Result<()> {
        Ok(())
    }

    /// Called once after the last frame of the group was delivered.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }

    /// Name for logging/debugging.
    fn name(&self) -> &'static str {
        "listener"
    }
}

/// Listener shared between the caller and the dispatch worker.
pub type SharedListener = Arc<Mutex<dyn FrameListener>>;

/// Wraps a listener for registration.
pub fn shared<L: FrameListener>(listener: L) -> SharedListener {
    Arc::new(Mutex::new(listener))
}

/// Collects every frame in memory. For tests and in-process consumers.
#[derive(Debug, Default)]
pub struct CollectorListener {
    denoised: Vec<Vec<u8>>,
    original: Vec<Vec<u8>>,
    finished: bool,
}

impl CollectorListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Processed frames in delivery order.
    pub fn frames(&self) -> &[Vec<u8>] {
        &self.denoised
    }

    /// Raw input chunks in push order.
    pub fn original_frames(&self) -> &[Vec<u8>] {
        &self.original
    }

    /// All processed bytes concatenated.
    pub fn concatenated(&self) -> Vec<u8> {
        self.denoised.concat()
    }

    pub fn total_bytes(&self) -> usize {
        self.denoised.iter().map(Vec::len).sum()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl FrameListener for CollectorListener {
    fn on_denoised_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.denoised.push(frame.to_vec());
        Ok(())
    }

    fn on_original_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.original.push(frame.to_vec());
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.finished = true;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "collector"
    }
}

/// Adapts a closure into a listener.
pub struct FnListener<F>
where
    F: FnMut(&[u8]) -> Result<()> + Send + 'static,
{
    callback: F,
    name: &'static str,
}

impl<F> FnListener<F>
where
    F: FnMut(&[u8]) -> Result<()> + Send + 'static,
{
    pub fn new(callback: F) -> Self {
        Self {
            callback,
            name: "fn",
        }
    }

    pub fn with_name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }
}

impl<F> FrameListener for FnListener<F>
where
    F: FnMut(&[u8]) -> Result<()> + Send + 'static,
{
    fn on_denoised_frame(&mut self, frame: &[u8]) -> Result<()> {
        (self.callback)(frame)
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DfStreamError;

    #[test]
    fn frame_listener_is_object_safe() {
        let _listener: Box<dyn FrameListener> = Box::new(CollectorListener::new());
    }

    #[test]
    fn collector_keeps_denoised_and_original_apart() {
        let mut collector = CollectorListener::new();
        collector.on_denoised_frame(&[1, 2]).unwrap();
        collector.on_original_frame(&[9]).unwrap();
        collector.on_denoised_frame(&[3, 4]).unwrap();

        assert_eq!(collector.frames(), &[vec![1, 2], vec![3, 4]]);
        assert_eq!(collector.original_frames(), &[vec![9]]);
        assert_eq!(collector.concatenated(), vec![1, 2, 3, 4]);
        assert_eq!(collector.total_bytes(), 4);
    }

    #[test]
    fn collector_records_finish() {
        let mut collector = CollectorListener::new();
        assert!(!collector.is_finished());
        collector.finish().unwrap();
        assert!(collector.is_finished());
    }

    #[test]
    fn fn_listener_invokes_closure() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut listener = FnListener::new(move |frame: &[u8]| {
            sink.lock().unwrap().push(frame.len());
            Ok(())
        })
        .with_name("lengths");

        listener.on_denoised_frame(&[0; 8]).unwrap();
        listener.on_denoised_frame(&[0; 4]).unwrap();
        // Original frames are ignored by default.
        listener.on_original_frame(&[0; 2]).unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![8, 4]);
        assert_eq!(listener.name(), "lengths");
    }

    #[test]
    fn fn_listener_propagates_errors() {
        let mut listener = FnListener::new(|_: &[u8]| Err(DfStreamError::Other("boom".into())));
        assert!(listener.on_denoised_frame(&[0]).is_err());
    }
}
