//! Model presets: backend model name, sampling temperature and prompt texts

use super::PromptKind;

/// Preamble that keeps reasoning models from echoing their chain of thought
const DIRECT_ANSWER_PREFIX: &str = "Answer directly without showing your reasoning process. ";

/// Group prompt used when the batch carries a context hint
const GROUP_WITH_CONTEXT: &str = "Based on this context and the photo summaries provided, output ONLY a comma-separated list of contextual tags that apply to this photo collection. No descriptions, no sentences, only tags.";

/// Prompt texts per [`PromptKind`]
#[derive(Debug, Clone, Copy)]
pub struct PromptSet {
    pub tags: &'static str,
    pub detailed_tags: &'static str,
    pub description: &'static str,
    pub brief: &'static str,
    pub group: &'static str,
}

impl PromptSet {
    pub fn get(&self, kind: PromptKind) -> &'static str {
        match kind {
            PromptKind::Tags => self.tags,
            PromptKind::DetailedTags => self.detailed_tags,
            PromptKind::Description => self.description,
            PromptKind::Brief => self.brief,
            PromptKind::Group => self.group,
        }
    }
}

/// Named model configuration
#[derive(Debug, Clone, Copy)]
pub struct ModelPreset {
    /// Lookup key (CLI `--model`, config `model.preset`)
    pub key: &'static str,
    /// Backend model name
    pub name: &'static str,
    pub description: &'static str,
    pub temperature: f32,
    pub prompts: PromptSet,
}

impl ModelPreset {
    /// Render the prompt for one request
    ///
    /// A hint becomes a `Context:` preamble. Qwen models get a direct-answer
    /// prefix except for free-text descriptions, where reasoning is allowed.
    pub fn render_prompt(&self, kind: PromptKind, hint: Option<&str>) -> String {
        let hint = hint.map(str::trim).filter(|h| !h.is_empty());

        let body = match (kind, hint) {
            (PromptKind::Group, Some(hint)) => {
                format!("Context: {}\n\n{}", hint, GROUP_WITH_CONTEXT)
            }
            (_, Some(hint)) => format!("Context: {}\n\n{}", hint, self.prompts.get(kind)),
            (_, None) => self.prompts.get(kind).to_string(),
        };

        if self.is_reasoning_model() && kind != PromptKind::Description {
            format!("{}{}", DIRECT_ANSWER_PREFIX, body)
        } else {
            body
        }
    }

    fn is_reasoning_model(&self) -> bool {
        self.name.to_lowercase().contains("qwen")
    }
}

/// Built-in presets, first is the default
pub const PRESETS: &[ModelPreset] = &[
    ModelPreset {
        key: "qwen3-vl:8b",
        name: "qwen3-vl:8b",
        description: "Maximum quality, slower",
        temperature: 0.3,
        prompts: PromptSet {
            tags: "You must respond ONLY with a comma-separated list of tags. Do not write sentences. Do not explain. Only output tags separated by commas.

Tags to include: subjects, objects, colors, composition, mood, location type.

Output format example: tag1, tag2, tag3, tag4

Now analyze this image and output ONLY the tags:",
            detailed_tags: "You must respond ONLY with a comma-separated list of detailed tags. Do not write sentences. Do not explain. Only output tags separated by commas.

Tags to include: main subjects, secondary elements, colors, lighting, time of day, weather, architectural style, activities, emotions.

Output format example: tag1, tag2, tag3, tag4, tag5, tag6

Now analyze this image and output ONLY the tags:",
            description: "Describe this image in detail. What do you see?",
            brief: "Briefly describe what you see in this image (one sentence):",
            group: "Output ONLY a comma-separated list of contextual tags for this photo collection. No descriptions, no sentences, only tags.",
        },
    },
    ModelPreset {
        key: "llava",
        name: "llava:latest",
        description: "Good quality/speed tradeoff",
        temperature: 0.5,
        prompts: PromptSet {
            tags: "List relevant tags for this image as a comma-separated list.
Include: subjects, objects, colors, composition, mood, location.
Format: tag1, tag2, tag3",
            detailed_tags: "Provide detailed tags for this image as a comma-separated list.
Include: subjects, elements, colors, lighting, weather, architecture, activities.
Format: tag1, tag2, tag3, tag4",
            description: "Describe this image in detail.",
            brief: "In one sentence, what do you see in this image?",
            group: "Provide contextual tags for this collection of photos (comma-separated list).",
        },
    },
];

/// Find a preset by key or backend model name
pub fn find_preset(key: &str) -> Option<&'static ModelPreset> {
    let key = key.trim();
    PRESETS.iter().find(|p| p.key == key || p.name == key)
}

/// Comma-separated preset keys, for error messages
pub fn available_presets() -> String {
    PRESETS.iter().map(|p| p.key).collect::<Vec<_>>().join(", ")
}
