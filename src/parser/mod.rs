//! Extraction of executable code from assistant replies

pub mod blocks;
pub mod tool_calls;

pub use blocks::{
    code_blocks, parse_complete, BlockOrigin, BlockParser, CodeBlock, ParseIssue, ParserOptions,
    Segment,
};
pub use tool_calls::{code_from_tool_call, parse_tool_calls_from_text, EXECUTE_TOOL_NAMES};
