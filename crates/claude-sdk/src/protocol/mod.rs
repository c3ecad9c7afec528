//! The stream-json protocol: typed messages, the parser, and the control
//! plane layered over the same byte stream.

mod control;
mod messages;
mod parser;

pub use control::{
    CanUseToolCallback, CanUseToolRequest, CanUseToolResponse, HookCallback, HookCallbackRequest,
    HookCallbackResponse, InitializeRequest, InterruptRequest, McpMessageCallback,
    McpMessageRequest, McpMessageResponse, ProtocolHandler, RewindFilesRequest,
    DEFAULT_CONTROL_TIMEOUT,
};
pub use messages::{
    AssistantBody, AssistantMessage, ContentBlock, ControlRequest, ControlResponse,
    ControlResponseBody, GenericMessage, Message, MessageContent, ResultMessage, SystemMessage,
    Usage, UserContent, UserMessage,
};
pub use parser::parse_message;
