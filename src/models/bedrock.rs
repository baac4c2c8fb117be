use serde::{Deserialize, Serialize};

// Bedrock serves several model families through one runtime endpoint;
// each family keeps its own body shape. Anthropic-family requests reuse
// the Messages types from `models::anthropic` with the Bedrock version
// string and no `model` field.

/// Amazon Titan text generation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TitanRequest {
    #[serde(rename = "inputText")]
    pub input_text: String,
    #[serde(rename = "textGenerationConfig")]
    pub text_generation_config: TitanGenerationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TitanGenerationConfig {
    #[serde(rename = "maxTokenCount")]
    pub max_token_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(rename = "topP", skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(rename = "stopSequences", skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
}

/// Amazon Titan response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TitanResponse {
    #[serde(rename = "inputTextTokenCount", default)]
    pub input_text_token_count: u64,
    pub results: Vec<TitanResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TitanResult {
    #[serde(rename = "tokenCount", default)]
    pub token_count: u64,
    #[serde(rename = "outputText")]
    pub output_text: String,
    #[serde(rename = "completionReason", skip_serializing_if = "Option::is_none")]
    pub completion_reason: Option<String>,
}

/// Titan streaming chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TitanChunk {
    #[serde(rename = "outputText", default)]
    pub output_text: String,
    #[serde(rename = "completionReason", skip_serializing_if = "Option::is_none")]
    pub completion_reason: Option<String>,
    #[serde(rename = "inputTextTokenCount", skip_serializing_if = "Option::is_none")]
    pub input_text_token_count: Option<u64>,
    #[serde(rename = "totalOutputTextTokenCount", skip_serializing_if = "Option::is_none")]
    pub total_output_text_token_count: Option<u64>,
}

/// AI21 Jurassic completion request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JurassicRequest {
    pub prompt: String,
    #[serde(rename = "maxTokens")]
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(rename = "topP", skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
}

/// AI21 Jurassic response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JurassicResponse {
    pub completions: Vec<JurassicCompletion>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JurassicCompletion {
    pub data: JurassicData,
    #[serde(rename = "finishReason", skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<JurassicFinishReason>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JurassicData {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JurassicFinishReason {
    pub reason: String,
}

/// Cohere Command chat request. The current message is separated from
/// the prior turns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CohereRequest {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_history: Option<Vec<CohereChatTurn>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preamble: Option<String>,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<CohereTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
}

/// One prior turn; role is "USER" or "CHATBOT"
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CohereChatTurn {
    pub role: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CohereTool {
    pub name: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameter_definitions: Option<serde_json::Value>,
}

/// Cohere Command response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CohereResponse {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<CohereMeta>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CohereMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub billed_units: Option<CohereBilledUnits>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CohereBilledUnits {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

/// Cohere streaming chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CohereChunk {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub is_finished: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// Meta Llama request (flat prompt)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlamaRequest {
    pub prompt: String,
    #[serde(rename = "max_gen_len")]
    pub max_gen_len: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(rename = "top_p", skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
}

/// Meta Llama response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlamaResponse {
    pub generation: String,
    #[serde(rename = "prompt_token_count", default)]
    pub prompt_token_count: u64,
    #[serde(rename = "generation_token_count", default)]
    pub generation_token_count: u64,
    #[serde(rename = "stop_reason", skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
}

/// Meta Llama streaming chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlamaChunk {
    #[serde(default)]
    pub generation: String,
    #[serde(rename = "prompt_token_count", skip_serializing_if = "Option::is_none")]
    pub prompt_token_count: Option<u64>,
    #[serde(rename = "generation_token_count", skip_serializing_if = "Option::is_none")]
    pub generation_token_count: Option<u64>,
    #[serde(rename = "stop_reason", skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
}

/// Envelope inside a Bedrock stream event: base64 of the family chunk JSON
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamPayload {
    pub bytes: String,
}
