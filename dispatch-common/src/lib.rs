//! Dispatch Common Types
//!
//! Wire types shared by the dispatch gateway and its callers: process
//! requests and responses, node/model views, and the chat protocol spoken
//! to compute nodes.

pub mod chat;
pub mod dispatch;
pub mod node;

pub use chat::{ChatCompletionRequest, ChatCompletionResponse, ChatMessage, Choice, Usage};
pub use dispatch::{
    ChainStepOutput, ChainStepSpec, ClassifyResponse, ErrorBody, ExecutionMode, ExecutionResult,
    JobParameters, JobStatus, MergeStrategy, MergeSummary, ProcessRequest, ProcessResponse,
    RoutingInfo, SchedulingInfo,
};
pub use node::{
    ModelEndpointInfo, ModelsResponse, NodeInfo, NodeStatus, NodeStatusUpdate, NodesResponse,
    RoutingRuleInfo, RoutingRulesResponse,
};
