use std::{fmt, sync::Arc};

use protocol::{
    chunk::{
        Action, ActionCard, AggregatedCard, DataTable, ErrorCard, FormCard, ListCard, Severity,
        TextBlock, UiChunk,
    },
    domain::RequestId,
    envelope::{ResponseEnvelope, UnrecognizedChunk, UnrecognizedReason, WireChunk},
};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::warn;

pub const UNKNOWN_COMPONENT_TITLE: &str = "Unknown Component Type";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChunkKey {
    pub request_id: RequestId,
    pub index: usize,
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.request_id, self.index)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Interaction {
    Action { action_id: String, payload: Value },
    FormSubmit {
        form_id: String,
        data: Map<String, Value>,
    },
}

type ActionCallback = Arc<dyn Fn(&str, Value) + Send + Sync>;
type FormSubmitCallback = Arc<dyn Fn(&str, Map<String, Value>) + Send + Sync>;

#[derive(Clone)]
pub struct Interactions {
    on_action: ActionCallback,
    on_form_submit: FormSubmitCallback,
}

impl Interactions {
    pub fn new(
        on_action: impl Fn(&str, Value) + Send + Sync + 'static,
        on_form_submit: impl Fn(&str, Map<String, Value>) + Send + Sync + 'static,
    ) -> Self {
        Self {
            on_action: Arc::new(on_action),
            on_form_submit: Arc::new(on_form_submit),
        }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Interaction>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let form_tx = tx.clone();
        let interactions = Self::new(
            move |action_id, payload| {
                let _ = tx.send(Interaction::Action {
                    action_id: action_id.to_string(),
                    payload,
                });
            },
            move |form_id, data| {
                let _ = form_tx.send(Interaction::FormSubmit {
                    form_id: form_id.to_string(),
                    data,
                });
            },
        );
        (interactions, rx)
    }

    pub fn noop() -> Self {
        Self::new(|_, _| {}, |_, _| {})
    }

    pub fn action(&self, action_id: &str, payload: Value) {
        (self.on_action)(action_id, payload);
    }

    /// Disabled actions are ignored.
    pub fn trigger(&self, action: &Action) -> bool {
        if action.disabled {
            return false;
        }
        self.action(&action.id, action.payload.clone().unwrap_or(Value::Null));
        true
    }

    pub fn submit_form(&self, form_id: &str, data: Map<String, Value>) {
        (self.on_form_submit)(form_id, data);
    }
}

impl fmt::Debug for Interactions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interactions").finish_non_exhaustive()
    }
}

pub struct RenderContext<'a> {
    pub key: &'a ChunkKey,
    pub interactions: &'a Interactions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkHandler {
    TextBlock,
    AggregatedCard,
    DataTable,
    ListCard,
    ActionCard,
    FormCard,
    ErrorCard,
}

pub fn dispatch_target(chunk: &WireChunk) -> ChunkHandler {
    match chunk {
        WireChunk::Known(UiChunk::TextBlock(_)) => ChunkHandler::TextBlock,
        WireChunk::Known(UiChunk::AggregatedCard(_)) => ChunkHandler::AggregatedCard,
        WireChunk::Known(UiChunk::DataTable(_)) => ChunkHandler::DataTable,
        WireChunk::Known(UiChunk::ListCard(_)) => ChunkHandler::ListCard,
        WireChunk::Known(UiChunk::ActionCard(_)) => ChunkHandler::ActionCard,
        WireChunk::Known(UiChunk::FormCard(_)) => ChunkHandler::FormCard,
        WireChunk::Known(UiChunk::ErrorCard(_)) | WireChunk::Unrecognized(_) => {
            ChunkHandler::ErrorCard
        }
    }
}

pub trait ChunkRenderer {
    type Output;

    fn text_block(&mut self, chunk: &TextBlock, cx: &RenderContext<'_>) -> Self::Output;
    fn aggregated_card(&mut self, chunk: &AggregatedCard, cx: &RenderContext<'_>) -> Self::Output;
    fn data_table(&mut self, chunk: &DataTable, cx: &RenderContext<'_>) -> Self::Output;
    fn list_card(&mut self, chunk: &ListCard, cx: &RenderContext<'_>) -> Self::Output;
    fn action_card(&mut self, chunk: &ActionCard, cx: &RenderContext<'_>) -> Self::Output;
    fn form_card(&mut self, chunk: &FormCard, cx: &RenderContext<'_>) -> Self::Output;
    fn error_card(&mut self, chunk: &ErrorCard, cx: &RenderContext<'_>) -> Self::Output;
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderedChunk<O> {
    pub key: ChunkKey,
    pub handler: ChunkHandler,
    pub output: O,
}

pub fn render<R: ChunkRenderer>(
    envelope: &ResponseEnvelope,
    renderer: &mut R,
    interactions: &Interactions,
) -> Vec<RenderedChunk<R::Output>> {
    envelope
        .chunks
        .iter()
        .enumerate()
        .map(|(index, chunk)| {
            let key = ChunkKey {
                request_id: envelope.request_id.clone(),
                index,
            };
            let cx = RenderContext {
                key: &key,
                interactions,
            };
            let output = render_chunk(chunk, renderer, &cx);
            RenderedChunk {
                handler: dispatch_target(chunk),
                key,
                output,
            }
        })
        .collect()
}

fn render_chunk<R: ChunkRenderer>(
    chunk: &WireChunk,
    renderer: &mut R,
    cx: &RenderContext<'_>,
) -> R::Output {
    match chunk {
        WireChunk::Known(UiChunk::TextBlock(inner)) => renderer.text_block(inner, cx),
        WireChunk::Known(UiChunk::AggregatedCard(inner)) => renderer.aggregated_card(inner, cx),
        WireChunk::Known(UiChunk::DataTable(inner)) => renderer.data_table(inner, cx),
        WireChunk::Known(UiChunk::ListCard(inner)) => renderer.list_card(inner, cx),
        WireChunk::Known(UiChunk::ActionCard(inner)) => renderer.action_card(inner, cx),
        WireChunk::Known(UiChunk::FormCard(inner)) => renderer.form_card(inner, cx),
        WireChunk::Known(UiChunk::ErrorCard(inner)) => renderer.error_card(inner, cx),
        WireChunk::Unrecognized(inner) => {
            warn!(key = %cx.key, chunk_type = %inner.type_name, "dispatch: rendering fallback for unrecognized chunk");
            renderer.error_card(&unknown_component_card(inner), cx)
        }
    }
}

pub fn unknown_component_card(chunk: &UnrecognizedChunk) -> ErrorCard {
    let message = match &chunk.reason {
        UnrecognizedReason::UnknownType => {
            format!("Unknown component type: {}", chunk.type_name)
        }
        UnrecognizedReason::MissingType => "Component is missing its `type` field".to_string(),
        UnrecognizedReason::Malformed(reason) => {
            format!("Malformed {} component: {reason}", chunk.type_name)
        }
    };
    ErrorCard {
        title: UNKNOWN_COMPONENT_TITLE.to_string(),
        message,
        severity: Severity::Error,
        actions: Vec::new(),
    }
}

#[cfg(test)]
#[path = "tests/dispatch_tests.rs"]
mod tests;
