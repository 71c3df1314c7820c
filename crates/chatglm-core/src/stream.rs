//! Streaming generation: the engine pushes text into a session sink, the
//! caller pulls it from a [`ChunkStream`].

use std::fmt;
use std::ops::ControlFlow;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::task::{Context, Poll};

use tokio::sync::mpsc;
use tokio_stream::Stream;
use tracing::{debug, warn};

use crate::backend::Backend;
use crate::config::GenerationConfig;
use crate::error::{ChatGlmError, Result};
use crate::handle::HandleInner;
use crate::registry::{HandleId, Sink};

const CHANNEL_CAPACITY: usize = 64;

/// Events emitted during streaming generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerateEvent {
    /// A non-empty piece of generated text.
    Chunk(String),
    /// Generation finished.
    Done {
        finish_reason: FinishReason,
        chunks: u32,
    },
    /// The engine failed; no further events follow.
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// The engine signalled end of output.
    Stop,
    /// The consumer cancelled or dropped the stream.
    Cancelled,
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stop => write!(f, "stop"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Lifecycle of one streaming call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Created,
    Registered,
    Streaming,
    Ended,
}

/// Per-call sink: forwards chunks into the channel read by [`ChunkStream`].
struct StreamSession {
    handle: HandleId,
    tx: mpsc::Sender<GenerateEvent>,
    cancelled: Arc<AtomicBool>,
    streaming: AtomicBool,
    ended: AtomicBool,
    chunks: AtomicU32,
}

impl StreamSession {
    fn transition(&self, state: SessionState) {
        debug!(handle = %self.handle, ?state, "Stream session");
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Sink for StreamSession {
    fn deliver(&self, text: &str, is_end: bool) -> ControlFlow<()> {
        if !self.streaming.swap(true, Ordering::AcqRel) {
            self.transition(SessionState::Streaming);
        }
        if is_end {
            self.ended.store(true, Ordering::Release);
        }
        if self.is_cancelled() {
            return ControlFlow::Break(());
        }
        if !text.is_empty() {
            if self
                .tx
                .blocking_send(GenerateEvent::Chunk(text.to_owned()))
                .is_err()
            {
                self.cancelled.store(true, Ordering::Release);
                return ControlFlow::Break(());
            }
            self.chunks.fetch_add(1, Ordering::Relaxed);
        }
        ControlFlow::Continue(())
    }

    fn registered(&self) {
        self.transition(SessionState::Registered);
    }
}

/// Start a streaming call for `inner` on a blocking task.
pub(crate) fn spawn<B: Backend>(
    inner: Arc<HandleInner<B>>,
    prompt: String,
    config: GenerationConfig,
) -> Result<ChunkStream> {
    let handle = inner.id();
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let cancelled = Arc::new(AtomicBool::new(false));
    let session = Arc::new(StreamSession {
        handle,
        tx,
        cancelled: Arc::clone(&cancelled),
        streaming: AtomicBool::new(false),
        ended: AtomicBool::new(false),
        chunks: AtomicU32::new(0),
    });
    session.transition(SessionState::Created);

    let job = move || produce(inner, prompt, config, session);
    match tokio::runtime::Handle::try_current() {
        Ok(rt) => {
            rt.spawn_blocking(job);
        }
        Err(_) => {
            std::thread::Builder::new()
                .name(format!("chatglm-stream-{}", handle.get()))
                .spawn(job)
                .map_err(|e| ChatGlmError::Spawn(e.to_string()))?;
        }
    }

    Ok(ChunkStream {
        handle,
        rx,
        cancelled,
        finished: false,
    })
}

fn produce<B: Backend>(
    inner: Arc<HandleInner<B>>,
    prompt: String,
    config: GenerationConfig,
    session: Arc<StreamSession>,
) {
    let tx = session.tx.clone();

    let terminal = if session.is_cancelled() {
        GenerateEvent::Done {
            finish_reason: FinishReason::Cancelled,
            chunks: 0,
        }
    } else {
        match inner.run(&prompt, &config, Arc::clone(&session) as Arc<dyn Sink>) {
            Ok(()) => {
                if !session.ended.load(Ordering::Acquire) && !session.is_cancelled() {
                    warn!(handle = %session.handle, "Engine returned without an end signal");
                }
                GenerateEvent::Done {
                    finish_reason: if session.is_cancelled() {
                        FinishReason::Cancelled
                    } else {
                        FinishReason::Stop
                    },
                    chunks: session.chunks.load(Ordering::Relaxed),
                }
            }
            Err(e) => {
                warn!(handle = %session.handle, "Streaming generation failed: {e}");
                GenerateEvent::Error(e.to_string())
            }
        }
    };
    session.transition(SessionState::Ended);
    drop(session);

    if tx.blocking_send(terminal).is_err() {
        debug!("Stream consumer gone before the terminal event");
    }
}

/// Pull side of a streaming call.
///
/// Yields each chunk in production order, then ends. An engine failure is
/// yielded once as `Err` before the end. Dropping the stream cancels the
/// call: the engine is told to stop delivering text.
///
/// Usable as a [`Stream`] from async code, or through
/// [`ChunkStream::blocking_iter`] from threads outside the async runtime.
pub struct ChunkStream {
    handle: HandleId,
    rx: mpsc::Receiver<GenerateEvent>,
    cancelled: Arc<AtomicBool>,
    finished: bool,
}

impl ChunkStream {
    pub fn handle(&self) -> HandleId {
        self.handle
    }

    /// Stop forwarding text; the stream then ends with
    /// [`FinishReason::Cancelled`].
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Next raw event, including the terminal one.
    pub async fn next_event(&mut self) -> Option<GenerateEvent> {
        if self.finished {
            return None;
        }
        let event = self.rx.recv().await;
        self.observe(event)
    }

    /// Blocking variant of [`ChunkStream::next_event`]. Must not be called
    /// from within an async execution context.
    pub fn blocking_next_event(&mut self) -> Option<GenerateEvent> {
        if self.finished {
            return None;
        }
        let event = self.rx.blocking_recv();
        self.observe(event)
    }

    /// Blocking iterator over the chunks. Must not be used from within an
    /// async execution context.
    pub fn blocking_iter(self) -> BlockingChunks {
        BlockingChunks { stream: self }
    }

    /// Drain the stream into one string.
    pub async fn collect_text(mut self) -> Result<String> {
        let mut text = String::new();
        while let Some(event) = self.next_event().await {
            match event {
                GenerateEvent::Chunk(chunk) => text.push_str(&chunk),
                GenerateEvent::Done { .. } => return Ok(text),
                GenerateEvent::Error(e) => return Err(ChatGlmError::GenerationFailed(e)),
            }
        }
        Err(closed_early())
    }

    fn observe(&mut self, event: Option<GenerateEvent>) -> Option<GenerateEvent> {
        match &event {
            Some(GenerateEvent::Chunk(_)) => {}
            Some(_) => self.finished = true,
            None => {
                self.finished = true;
                return Some(GenerateEvent::Error(closed_early().to_string()));
            }
        }
        event
    }

    fn to_item(event: Option<GenerateEvent>) -> Option<Result<String>> {
        match event? {
            GenerateEvent::Chunk(chunk) => Some(Ok(chunk)),
            GenerateEvent::Done { .. } => None,
            GenerateEvent::Error(e) => Some(Err(ChatGlmError::GenerationFailed(e))),
        }
    }
}

fn closed_early() -> ChatGlmError {
    ChatGlmError::GenerationFailed("stream closed without a terminal event".into())
}

impl Stream for ChunkStream {
    type Item = Result<String>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(event) => {
                let event = this.observe(event);
                Poll::Ready(Self::to_item(event))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Blocking [`Iterator`] adapter returned by [`ChunkStream::blocking_iter`].
pub struct BlockingChunks {
    stream: ChunkStream,
}

impl Iterator for BlockingChunks {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        let event = self.stream.blocking_next_event();
        ChunkStream::to_item(event)
    }
}

impl Drop for ChunkStream {
    fn drop(&mut self) {
        if !self.finished {
            self.cancel();
        }
    }
}
