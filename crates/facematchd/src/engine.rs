use facematch_core::{panic_message, CompareError, EmbeddingExtractor, ImagePayload, SimilarityIndex};
use std::panic::{self, AssertUnwindSafe};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Compare(#[from] CompareError),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Work shipped from HTTP handlers to the engine thread. The job owns its
/// reply channel.
type EngineJob = Box<dyn FnOnce(&mut dyn EmbeddingExtractor) + Send>;

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineJob>,
}

impl EngineHandle {
    /// Compare the faces in two decoded images on the engine thread.
    pub async fn compare(
        &self,
        a: ImagePayload,
        b: ImagePayload,
    ) -> Result<SimilarityIndex, EngineError> {
        self.run(move |extractor| facematch_core::compare(extractor, &a, &b))
            .await
    }

    /// Run `work` against the extractor on the engine thread.
    ///
    /// A panic inside `work` is caught on the engine thread and comes back as
    /// [`CompareError::Failure`]; the thread keeps serving.
    pub async fn run<T, F>(&self, work: F) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn EmbeddingExtractor) -> Result<T, CompareError> + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: EngineJob = Box::new(move |extractor| {
            let started = std::time::Instant::now();
            let result = panic::catch_unwind(AssertUnwindSafe(|| work(extractor)))
                .unwrap_or_else(|payload| {
                    let msg = panic_message(payload.as_ref())
                        .unwrap_or_else(|| "engine job panicked".into());
                    tracing::error!(error = %msg, "engine job panicked");
                    Err(CompareError::Failure(msg))
                });
            tracing::debug!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                ok = result.is_ok(),
                "engine job finished"
            );
            // Caller may have gone away (client disconnect)
            let _ = reply_tx.send(result);
        });

        self.tx
            .send(job)
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        Ok(reply_rx.await.map_err(|_| EngineError::ChannelClosed)??)
    }

    /// A handle whose engine is already gone.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        let (tx, _rx) = mpsc::channel(1);
        Self { tx }
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The extractor holds ONNX sessions that need exclusive access, so it is
/// owned by one thread and jobs are served in arrival order. The thread
/// exits once every [`EngineHandle`] is dropped.
pub fn spawn_engine<E>(extractor: E, queue_depth: usize) -> std::io::Result<EngineHandle>
where
    E: EmbeddingExtractor + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineJob>(queue_depth.max(1));
    let mut extractor = extractor;

    std::thread::Builder::new()
        .name("facematch-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(job) = rx.blocking_recv() {
                job(&mut extractor);
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx })
}
