//! Static provider table.
//!
//! Each [`ProviderConfig`] describes how a credential for that provider is
//! presented upstream: which base URL to call, which header carries the
//! secret, and what prefix precedes it.  The table is compiled in and never
//! persisted.

/// How to call one provider's API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Stable identifier used in credentials and requests.
    pub id: &'static str,
    /// Human-readable name.
    pub display_name: &'static str,
    /// Base URL that endpoint paths are appended to.  Empty when the caller
    /// must supply one.
    pub base_url: &'static str,
    /// Header that carries the secret.
    pub auth_header: &'static str,
    /// Prefix placed before the secret in the auth header value.
    pub auth_prefix: &'static str,
    /// Whether the base URL must come from the request or the credential.
    pub requires_caller_endpoint: bool,
    /// Fixed headers added after the auth header.
    pub extra_headers: &'static [(&'static str, &'static str)],
}

const BEARER: &str = "Bearer ";
const AUTHORIZATION: &str = "Authorization";

const fn bearer(
    id: &'static str,
    display_name: &'static str,
    base_url: &'static str,
) -> ProviderConfig {
    ProviderConfig {
        id,
        display_name,
        base_url,
        auth_header: AUTHORIZATION,
        auth_prefix: BEARER,
        requires_caller_endpoint: false,
        extra_headers: &[],
    }
}

/// Every provider Keyhaven knows how to call.
pub static PROVIDERS: [ProviderConfig; 11] = [
    bearer("openai", "OpenAI", "https://api.openai.com"),
    ProviderConfig {
        id: "anthropic",
        display_name: "Anthropic",
        base_url: "https://api.anthropic.com",
        auth_header: "x-api-key",
        auth_prefix: "",
        requires_caller_endpoint: false,
        extra_headers: &[("anthropic-version", "2023-06-01")],
    },
    ProviderConfig {
        id: "google",
        display_name: "Google Gemini",
        base_url: "https://generativelanguage.googleapis.com",
        auth_header: "x-goog-api-key",
        auth_prefix: "",
        requires_caller_endpoint: false,
        extra_headers: &[],
    },
    bearer("mistral", "Mistral AI", "https://api.mistral.ai"),
    bearer("cohere", "Cohere", "https://api.cohere.com"),
    bearer("groq", "Groq", "https://api.groq.com/openai"),
    bearer("together", "Together AI", "https://api.together.xyz"),
    bearer("perplexity", "Perplexity", "https://api.perplexity.ai"),
    bearer("deepseek", "DeepSeek", "https://api.deepseek.com"),
    bearer("openrouter", "OpenRouter", "https://openrouter.ai/api"),
    ProviderConfig {
        id: "ollama",
        display_name: "Ollama (self-hosted)",
        base_url: "",
        auth_header: AUTHORIZATION,
        auth_prefix: BEARER,
        requires_caller_endpoint: true,
        extra_headers: &[],
    },
];

/// Look up a provider by id.
pub fn find_provider(id: &str) -> Option<&'static ProviderConfig> {
    PROVIDERS.iter().find(|p| p.id == id)
}

/// The full provider table.
pub fn providers() -> &'static [ProviderConfig] {
    &PROVIDERS
}
