/// Upstream status codes worth retrying before the stream opens
pub const RETRYABLE_STATUS_CODES: &[u16] = &[429, 500, 502, 503, 504, 520];

/// OpenAI-compatible API defaults
pub const DEFAULT_UPSTREAM_BASE_URL: &str = "https://api.openai.com/v1";
pub const CHAT_COMPLETIONS_PATH: &str = "/chat/completions";
pub const IMAGES_PATH: &str = "/images/generations";

/// Models
pub const COMPLETION_MODEL: &str = "gpt-5-mini";
pub const TITLE_MODEL: &str = "gpt-4o-mini";
pub const IMAGE_MODEL: &str = "gpt-image-1";

/// Outbound flush policy: a content frame goes out once the buffer holds
/// this many characters, or once this much time has passed since the last
/// flush, whichever comes first.
pub const FLUSH_MIN_CHARS: usize = 3;
pub const FLUSH_INTERVAL_MS: u64 = 16;

/// Attachment extraction limits
pub const MAX_ATTACHMENT_CHARS: usize = 50_000;
pub const ATTACHMENT_TRUNCATION_MARKER: &str = "\n\n[... content truncated ...]";
/// Fraction of NUL bytes at or above which a decoded payload counts as binary
pub const NUL_BINARY_FRACTION: f64 = 0.10;

/// Separator between inlined attachment sections in a user turn
pub const FILE_SECTION_SEPARATOR: &str = "\n\n---\n\n";

/// Chat titles
pub const TITLE_MAX_CHARS: usize = 50;
pub const TITLE_MAX_TOKENS: u32 = 20;
pub const TITLE_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_CHAT_TITLE: &str = "New Chat";

pub const TITLE_SYSTEM_PROMPT: &str = "Generate a concise, descriptive title (maximum 50 characters) for a chat conversation based on the user's first message. Return only the title, nothing else. Make it clear and specific.";

/// Tool names
pub const TOOL_GENERATE_IMAGE: &str = "generate_image";

/// Sizes the image tool accepts; anything else is dropped from the request
pub const IMAGE_SIZES: &[&str] = &["1024x1024", "1792x1024", "1024x1792"];

/// Appended verbatim to the system preamble. The preamble file mentions a
/// wider tool surface than this server actually exposes; this note pins down
/// which of them exist here.
pub const AVAILABLE_TOOLS_NOTE: &str = "\n\n## Available Tools\n\nYou have access to the following tools:\n\n1. **generate_image** - Generate images from a text prompt. Use this when users request image generation, creation, or visualization.\n\nNote: Other tools mentioned in the prompt (bio, canmore, python, web, file_search, automations, guardian_tool) are not available in this API implementation. For those requests, provide helpful text-based responses explaining what you would do if the tool were available.";

/// Database defaults
pub const DB_PRAGMAS: &[&str] = &[
    "PRAGMA journal_mode = WAL",
    "PRAGMA synchronous = NORMAL",
    "PRAGMA busy_timeout = 5000",
];

/// Streaming guards
pub const MAX_STREAM_LINES: usize = 100_000;
pub const MAX_STREAM_LINE_BYTES: usize = 1024 * 1024;
