use crate::{DeviceProperties, FrameRx};

/// A pipeline node producing one finite sequence of PCM frames.
///
/// `output_stream` hands out the node's outbound channel exactly once; the
/// channel closing signals end-of-stream. Frames yielded by the stream
/// conform to `properties()`. `close` is idempotent and cascades downstream
/// by ending the outbound stream.
pub trait Source: Send {
    fn properties(&self) -> DeviceProperties;

    /// Take the outbound stream. Fails with `SourceClosed` once taken or
    /// after `close`.
    fn output_stream(&mut self) -> crate::Result<FrameRx>;

    fn close(&self);
}

/// A pipeline node consuming one inbound sequence of PCM frames.
///
/// `attach` is called at most once per sink lifetime. When the inbound
/// stream ends the sink tears itself down; pass-through nodes close their
/// own outbound stream in turn.
pub trait Sink: Send {
    fn properties(&self) -> DeviceProperties;

    /// Attach the inbound stream. Fails with `SinkAlreadyAttached` on a
    /// second call.
    fn attach(&mut self, input: FrameRx) -> crate::Result<()>;
}

/// Wire a source into a sink, verifying the formats agree first.
pub fn connect(source: &mut dyn Source, sink: &mut dyn Sink) -> crate::Result<()> {
    let actual = source.properties();
    let expected = sink.properties();
    if actual != expected {
        return Err(crate::AudioError::PropertyMismatch { expected, actual });
    }
    sink.attach(source.output_stream()?)
}
