//! Provider adapters: canonical request ⇄ provider wire translation and
//! SSE re-encoding into the Anthropic Messages event stream the client
//! expects.

pub mod adapter;
pub mod anthropic_compat;
pub mod canonical;
pub mod catalog;
pub mod emit;
pub mod gemini;
pub mod oauth;
pub mod openai;
pub mod sse;

use serde::{Deserialize, Serialize};

/// Wire families the adapters speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Wire {
    OpenAi,
    Gemini,
    Anthropic,
}

/// Feature support advertised per provider.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Capabilities {
    pub tools: bool,
    pub vision: bool,
    pub streaming: bool,
    pub json_mode: bool,
    pub reasoning: bool,
}

/// Static description of one upstream provider.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderDescriptor {
    pub name: &'static str,
    pub base_url: &'static str,
    pub api_path: &'static str,
    /// Environment variable holding the static API key; empty when the
    /// provider is OAuth-managed.
    pub api_key_env: &'static str,
    pub url_prefixes: &'static [&'static str],
    pub wire: Wire,
    pub capabilities: Capabilities,
    pub extra_headers: &'static [(&'static str, &'static str)],
}

const FULL_CAPS: Capabilities = Capabilities {
    tools: true,
    vision: true,
    streaming: true,
    json_mode: true,
    reasoning: true,
};

const TEXT_CAPS: Capabilities = Capabilities {
    tools: true,
    vision: false,
    streaming: true,
    json_mode: false,
    reasoning: true,
};

/// The provider table. Order matters only for prefix resolution, which
/// checks longer prefixes first via `resolve`.
pub const PROVIDERS: &[ProviderDescriptor] = &[
    ProviderDescriptor {
        name: "openai",
        base_url: "https://api.openai.com",
        api_path: "/v1/chat/completions",
        api_key_env: "OPENAI_API_KEY",
        url_prefixes: &["oai/"],
        wire: Wire::OpenAi,
        capabilities: FULL_CAPS,
        extra_headers: &[],
    },
    ProviderDescriptor {
        name: "gemini",
        base_url: "https://generativelanguage.googleapis.com",
        api_path: "/v1beta/models/{model}:streamGenerateContent?alt=sse",
        api_key_env: "GEMINI_API_KEY",
        url_prefixes: &["gemini/", "g/"],
        wire: Wire::Gemini,
        capabilities: FULL_CAPS,
        extra_headers: &[],
    },
    ProviderDescriptor {
        name: "openrouter",
        base_url: "https://openrouter.ai",
        api_path: "/api/v1/chat/completions",
        api_key_env: "OPENROUTER_API_KEY",
        url_prefixes: &["or/"],
        wire: Wire::OpenAi,
        capabilities: FULL_CAPS,
        extra_headers: &[
            ("HTTP-Referer", "https://claudish.local"),
            ("X-Title", "Claudish"),
        ],
    },
    ProviderDescriptor {
        name: "minimax",
        base_url: "https://api.minimax.io",
        api_path: "/anthropic/v1/messages",
        api_key_env: "MINIMAX_API_KEY",
        url_prefixes: &["mm/"],
        wire: Wire::Anthropic,
        capabilities: TEXT_CAPS,
        extra_headers: &[],
    },
    ProviderDescriptor {
        name: "kimi",
        base_url: "https://api.moonshot.ai",
        api_path: "/anthropic/v1/messages",
        // OAuth-managed; the env var is the explicit fallback.
        api_key_env: "MOONSHOT_API_KEY",
        url_prefixes: &["kimi/"],
        wire: Wire::Anthropic,
        capabilities: TEXT_CAPS,
        extra_headers: &[],
    },
    ProviderDescriptor {
        name: "glm",
        base_url: "https://open.bigmodel.cn",
        api_path: "/api/anthropic/v1/messages",
        api_key_env: "GLM_API_KEY",
        url_prefixes: &["glm/"],
        wire: Wire::Anthropic,
        capabilities: TEXT_CAPS,
        extra_headers: &[],
    },
    ProviderDescriptor {
        name: "ollamacloud",
        base_url: "https://ollama.com",
        api_path: "/v1/chat/completions",
        api_key_env: "OLLAMA_API_KEY",
        url_prefixes: &["zen/"],
        wire: Wire::OpenAi,
        capabilities: TEXT_CAPS,
        extra_headers: &[],
    },
];

/// A routing target resolved to a provider and its bare model id.
#[derive(Debug, Clone)]
pub struct ResolvedTarget {
    pub descriptor: &'static ProviderDescriptor,
    /// Model id with the routing prefix stripped.
    pub model: String,
    /// The original prefixed id, for usage accounting.
    pub prefixed_model: String,
}

/// Recognize a prefixed target model id.
///
/// Longest matching prefix wins; a bare `vendor/model` id with no known
/// prefix falls through to OpenRouter, which serves exactly that naming
/// scheme.
pub fn resolve(target_model: &str) -> Option<ResolvedTarget> {
    let mut best: Option<(&'static ProviderDescriptor, &'static str)> = None;
    for descriptor in PROVIDERS {
        for prefix in descriptor.url_prefixes {
            if target_model.starts_with(prefix)
                && best.is_none_or(|(_, current)| prefix.len() > current.len())
            {
                best = Some((descriptor, prefix));
            }
        }
    }

    if let Some((descriptor, prefix)) = best {
        return Some(ResolvedTarget {
            descriptor,
            model: target_model[prefix.len()..].to_string(),
            prefixed_model: target_model.to_string(),
        });
    }

    // OpenRouter default for bare vendor/model ids.
    if target_model.contains('/') {
        let descriptor = PROVIDERS.iter().find(|d| d.name == "openrouter")?;
        return Some(ResolvedTarget {
            descriptor,
            model: target_model.to_string(),
            prefixed_model: target_model.to_string(),
        });
    }

    None
}
