//! Seam to the external dialect translators.
//!
//! The executor speaks the Antigravity wire shape; converting to and from
//! the client-facing dialect (Claude, OpenAI, Gemini) is the translators'
//! job and stays outside this workspace. The identity implementation is
//! for native Gemini clients and tests.

/// Converts payloads between the client dialect and the upstream dialect.
pub trait DialectTranslator: Send + Sync {
    /// Client request payload -> upstream request body (pre-shaping).
    fn translate_request(&self, model: &str, payload: &[u8], stream: bool) -> Vec<u8>;

    /// Upstream non-stream body -> client dialect.
    fn translate_response(&self, model: &str, payload: &[u8]) -> Vec<u8>;

    /// One upstream NDJSON chunk -> zero or more client chunks.
    fn translate_chunk(&self, model: &str, payload: &[u8]) -> Vec<Vec<u8>>;

    /// Terminal sentinel -> trailing client chunks.
    fn translate_done(&self, model: &str) -> Vec<Vec<u8>>;

    /// Upstream token count -> client dialect count-tokens body.
    fn translate_token_count(&self, model: &str, total_tokens: i64, payload: &[u8]) -> Vec<u8>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityTranslator;

impl DialectTranslator for IdentityTranslator {
    fn translate_request(&self, _model: &str, payload: &[u8], _stream: bool) -> Vec<u8> {
        payload.to_vec()
    }

    fn translate_response(&self, _model: &str, payload: &[u8]) -> Vec<u8> {
        payload.to_vec()
    }

    fn translate_chunk(&self, _model: &str, payload: &[u8]) -> Vec<Vec<u8>> {
        vec![payload.to_vec()]
    }

    fn translate_done(&self, _model: &str) -> Vec<Vec<u8>> {
        Vec::new()
    }

    fn translate_token_count(&self, _model: &str, _total_tokens: i64, payload: &[u8]) -> Vec<u8> {
        payload.to_vec()
    }
}
