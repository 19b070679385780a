use ocellus_xr::XrResult;

use crate::frame::FrameStateRecord;

/// Draw-work sink invoked on the submission stage between begin and end frame.
pub trait RenderBackend {
    fn submit(&mut self, record: &FrameStateRecord) -> XrResult<()>;
}

/// Backend that accepts every frame and draws nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullBackend;

impl RenderBackend for NullBackend {
    fn submit(&mut self, _record: &FrameStateRecord) -> XrResult<()> {
        Ok(())
    }
}

impl<F> RenderBackend for F
where
    F: FnMut(&FrameStateRecord) -> XrResult<()>,
{
    fn submit(&mut self, record: &FrameStateRecord) -> XrResult<()> {
        self(record)
    }
}
