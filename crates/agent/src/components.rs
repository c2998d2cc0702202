use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};

/// One renderable piece of a response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiComponent {
    Text { text: String },
    Card { title: String, body: String },
    Menu { title: String, options: Vec<MenuOption> },
    Status { level: StatusLevel, message: String },
    ToolResult { tool_name: String, success: bool, summary: String },
}

impl UiComponent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn card(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self::Card { title: title.into(), body: body.into() }
    }

    pub fn status(level: StatusLevel, message: impl Into<String>) -> Self {
        Self::Status { level, message: message.into() }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MenuOption {
    pub label: String,
    pub command: String,
}

impl MenuOption {
    pub fn new(label: impl Into<String>, command: impl Into<String>) -> Self {
        Self { label: label.into(), command: command.into() }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusLevel {
    Info,
    Success,
    Warning,
    Error,
}

pub type ComponentStream = BoxStream<'static, UiComponent>;

pub fn component_stream(components: Vec<UiComponent>) -> ComponentStream {
    stream::iter(components).boxed()
}
