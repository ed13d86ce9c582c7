//! Engine reuse.
//!
//! Building an engine is slow, so the server builds one at startup and hands
//! it to every job whose language set matches. Jobs asking for anything else
//! get an engine of their own, which is dropped when the job finishes.

use std::sync::Arc;

use image::RgbImage;
use tokio::sync::Mutex;

use crate::prelude::*;

use super::{
    LanguageSet,
    engines::{EngineFactory, OcrEngine},
    normalize::RawDetection,
};

/// An engine shared between concurrent jobs.
///
/// We make no assumptions about whether the wrapped engine is safe to call
/// from several tasks at once, so calls to [`OcrEngine::detect`] are
/// serialized.
pub struct SharedEngine {
    inner: Arc<dyn OcrEngine>,
    lock: Mutex<()>,
}

impl SharedEngine {
    /// Wrap `inner` so that only one `detect` call runs at a time.
    pub fn new(inner: Arc<dyn OcrEngine>) -> Self {
        Self {
            inner,
            lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl OcrEngine for SharedEngine {
    fn languages(&self) -> &LanguageSet {
        self.inner.languages()
    }

    async fn detect(&self, image: Arc<RgbImage>) -> Result<Vec<RawDetection>> {
        let _guard = self.lock.lock().await;
        self.inner.detect(image).await
    }
}

/// Holds at most one pre-warmed engine.
#[derive(Clone, Default)]
pub struct EnginePool {
    prewarmed: Option<Arc<dyn OcrEngine>>,
}

impl EnginePool {
    /// A pool with no pre-warmed engine. Every job builds its own.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Try to build the pre-warmed engine. If that fails, we log a warning and
    /// carry on without one.
    #[instrument(level = "debug", skip(factory), fields(languages = %languages))]
    pub async fn prewarm(
        factory: &dyn EngineFactory,
        languages: &LanguageSet,
        use_gpu: bool,
    ) -> Self {
        match factory.build(languages, use_gpu).await {
            Ok(engine) => {
                info!(languages = %languages, use_gpu, "Pre-warmed OCR engine");
                Self {
                    prewarmed: Some(Arc::new(SharedEngine::new(engine))),
                }
            }
            Err(err) => {
                warn!(
                    languages = %languages,
                    "Could not pre-warm OCR engine, continuing without one: {:#}",
                    err
                );
                Self::empty()
            }
        }
    }

    /// The pre-warmed engine, if we have one.
    #[cfg(test)]
    pub fn prewarmed(&self) -> Option<&Arc<dyn OcrEngine>> {
        self.prewarmed.as_ref()
    }

    /// The pre-warmed engine, if it was built for exactly `languages`.
    ///
    /// Order doesn't matter, but a superset or subset doesn't count.
    pub fn engine_for(&self, languages: &LanguageSet) -> Option<Arc<dyn OcrEngine>> {
        self.prewarmed
            .as_ref()
            .filter(|engine| engine.languages().is_same_set(languages))
            .cloned()
    }
}
