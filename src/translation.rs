//! Page-side immersive translation: translate a page unit by unit, with
//! pause, resume and cancel from the UI.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::ai::client::{AssistantApi, ProgressFn};
use crate::errors::AssistantError;

/// Units whose trimmed text is this short or shorter are left alone.
pub const MIN_UNIT_CHARS: usize = 20;

/// Receives each segment as soon as it is translated.
pub type SegmentFn = dyn Fn(&TranslatedSegment) + Send + Sync;

/// Pause, resume and cancel for one translation run. Clones share state.
#[derive(Debug, Clone)]
pub struct TranslationControl {
    cancel: CancellationToken,
    paused: Arc<watch::Sender<bool>>,
}

impl Default for TranslationControl {
    fn default() -> Self {
        Self::new()
    }
}

impl TranslationControl {
    #[must_use]
    pub fn new() -> Self {
        let (paused, _receiver) = watch::channel(false);
        Self {
            cancel: CancellationToken::new(),
            paused: Arc::new(paused),
        }
    }

    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    /// Stops the run at the next unit boundary and aborts the unit in flight.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Waits while paused. Returns `false` once the run is cancelled.
    pub async fn proceed(&self) -> bool {
        let mut paused = self.paused.subscribe();
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => false,
            resumed = paused.wait_for(|paused| !*paused) => resumed.is_ok(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranslatedSegment {
    /// Position of the unit in the input.
    pub index: usize,
    pub original: String,
    pub translated: String,
    /// The translation failed and `translated` holds the original text.
    pub fell_back: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranslationOutcome {
    Completed(Vec<TranslatedSegment>),
    /// Cancelled part-way; carries the segments finished before that.
    Cancelled(Vec<TranslatedSegment>),
}

impl TranslationOutcome {
    #[must_use]
    pub fn segments(&self) -> &[TranslatedSegment] {
        match self {
            Self::Completed(segments) | Self::Cancelled(segments) => segments,
        }
    }

    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

/// Translates `units` one by one in professional mode.
///
/// A unit that fails keeps its original text and the run carries on.
/// `on_progress` reports `(index + 1, total)` after every translated unit.
pub async fn translate_elements<A>(
    api: &A,
    units: &[String],
    target_lang: Option<&str>,
    control: &TranslationControl,
    on_progress: Option<&ProgressFn>,
    on_segment: Option<&SegmentFn>,
) -> TranslationOutcome
where
    A: AssistantApi + ?Sized,
{
    let total = units.len();
    let mut segments = Vec::new();
    info!(units = total, "Starting immersive translation");

    for (index, unit) in units.iter().enumerate() {
        if !control.proceed().await {
            info!(done = segments.len(), "Immersive translation cancelled");
            return TranslationOutcome::Cancelled(segments);
        }

        let text = unit.trim();
        if text.chars().count() <= MIN_UNIT_CHARS {
            continue;
        }

        let segment = match api.translate(text, target_lang, true, control.token()).await {
            Ok(translated) => TranslatedSegment {
                index,
                original: text.to_string(),
                translated,
                fell_back: false,
            },
            Err(AssistantError::Cancelled) => {
                info!(done = segments.len(), "Immersive translation cancelled");
                return TranslationOutcome::Cancelled(segments);
            }
            Err(e) => {
                warn!(unit = index, error = %e, "Unit translation failed, keeping original");
                TranslatedSegment {
                    index,
                    original: text.to_string(),
                    translated: text.to_string(),
                    fell_back: true,
                }
            }
        };

        if let Some(on_segment) = on_segment {
            on_segment(&segment);
        }
        segments.push(segment);
        if let Some(on_progress) = on_progress {
            on_progress(index + 1, total);
        }
    }

    info!(translated = segments.len(), "Immersive translation completed");
    TranslationOutcome::Completed(segments)
}
