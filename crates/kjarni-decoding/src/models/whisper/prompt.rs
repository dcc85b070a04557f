//! Decoder prompt for Whisper: previous-text context, language and task
//! tokens.

use std::collections::HashMap;

use ndarray::{Array2, Axis, concatenate};
use once_cell::sync::Lazy;

use crate::common::GenerationConfig;
use crate::error::{GenerationError, GenerationResult};

/// The tasks a multilingual checkpoint is trained for.
pub const TASKS: &[&str] = &["transcribe", "translate"];

/// Language codes and names of the multilingual vocabulary, in token order.
pub const LANGUAGES: &[(&str, &str)] = &[
    ("en", "english"),
    ("zh", "chinese"),
    ("de", "german"),
    ("es", "spanish"),
    ("ru", "russian"),
    ("ko", "korean"),
    ("fr", "french"),
    ("ja", "japanese"),
    ("pt", "portuguese"),
    ("tr", "turkish"),
    ("pl", "polish"),
    ("ca", "catalan"),
    ("nl", "dutch"),
    ("ar", "arabic"),
    ("sv", "swedish"),
    ("it", "italian"),
    ("id", "indonesian"),
    ("hi", "hindi"),
    ("fi", "finnish"),
    ("vi", "vietnamese"),
    ("he", "hebrew"),
    ("uk", "ukrainian"),
    ("el", "greek"),
    ("ms", "malay"),
    ("cs", "czech"),
    ("ro", "romanian"),
    ("da", "danish"),
    ("hu", "hungarian"),
    ("ta", "tamil"),
    ("no", "norwegian"),
    ("th", "thai"),
    ("ur", "urdu"),
    ("hr", "croatian"),
    ("bg", "bulgarian"),
    ("lt", "lithuanian"),
    ("la", "latin"),
    ("mi", "maori"),
    ("ml", "malayalam"),
    ("cy", "welsh"),
    ("sk", "slovak"),
    ("te", "telugu"),
    ("fa", "persian"),
    ("lv", "latvian"),
    ("bn", "bengali"),
    ("sr", "serbian"),
    ("az", "azerbaijani"),
    ("sl", "slovenian"),
    ("kn", "kannada"),
    ("et", "estonian"),
    ("mk", "macedonian"),
    ("br", "breton"),
    ("eu", "basque"),
    ("is", "icelandic"),
    ("hy", "armenian"),
    ("ne", "nepali"),
    ("mn", "mongolian"),
    ("bs", "bosnian"),
    ("kk", "kazakh"),
    ("sq", "albanian"),
    ("sw", "swahili"),
    ("gl", "galician"),
    ("mr", "marathi"),
    ("pa", "punjabi"),
    ("si", "sinhala"),
    ("km", "khmer"),
    ("sn", "shona"),
    ("yo", "yoruba"),
    ("so", "somali"),
    ("af", "afrikaans"),
    ("oc", "occitan"),
    ("ka", "georgian"),
    ("be", "belarusian"),
    ("tg", "tajik"),
    ("sd", "sindhi"),
    ("gu", "gujarati"),
    ("am", "amharic"),
    ("yi", "yiddish"),
    ("lo", "lao"),
    ("uz", "uzbek"),
    ("fo", "faroese"),
    ("ht", "haitian creole"),
    ("ps", "pashto"),
    ("tk", "turkmen"),
    ("nn", "nynorsk"),
    ("mt", "maltese"),
    ("sa", "sanskrit"),
    ("lb", "luxembourgish"),
    ("my", "myanmar"),
    ("bo", "tibetan"),
    ("tl", "tagalog"),
    ("mg", "malagasy"),
    ("as", "assamese"),
    ("tt", "tatar"),
    ("haw", "hawaiian"),
    ("ln", "lingala"),
    ("ha", "hausa"),
    ("ba", "bashkir"),
    ("jw", "javanese"),
    ("su", "sundanese"),
    ("yue", "cantonese"),
];

static LANGUAGE_CODES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    let mut m = HashMap::new();
    for &(code, name) in LANGUAGES {
        m.insert(code, code);
        m.insert(name, code);
    }
    m
});

/// Language token for `<|en|>`, `en` or `english` (any case).
pub fn language_token(language: &str, lang_to_id: Option<&HashMap<String, u32>>) -> GenerationResult<u32> {
    let trimmed = language.trim();
    let tag = if trimmed.starts_with("<|") && trimmed.ends_with("|>") {
        trimmed.to_string()
    } else {
        let lower = trimmed.to_lowercase();
        let code = LANGUAGE_CODES
            .get(lower.as_str())
            .ok_or_else(|| GenerationError::config(format!("unsupported language: {}", language)))?;
        format!("<|{}|>", code)
    };

    let lang_to_id = lang_to_id
        .ok_or_else(|| GenerationError::config("language requires lang_to_id"))?;
    lang_to_id
        .get(&tag)
        .copied()
        .ok_or_else(|| GenerationError::config(format!("{} is not in lang_to_id", tag)))
}

/// Task token for `transcribe` or `translate`.
pub fn task_token(task: &str, task_to_id: Option<&HashMap<String, u32>>) -> GenerationResult<u32> {
    let task = task.trim().to_lowercase();
    if !TASKS.contains(&task.as_str()) {
        return Err(GenerationError::config(format!(
            "unsupported task: {}, expected one of {:?}",
            task, TASKS
        )));
    }
    let task_to_id = task_to_id.ok_or_else(|| GenerationError::config("task requires task_to_id"))?;
    task_to_id
        .get(&task)
        .copied()
        .ok_or_else(|| GenerationError::config(format!("{} is not in task_to_id", task)))
}

/// Tokens forced right after the decoder start: language and task for
/// multilingual checkpoints, then `<|notimestamps|>` unless timestamps are
/// requested.
///
/// Returns `None` when none of `language`, `task` or `is_multilingual` is
/// set, leaving the resolved `forced_decoder_ids` untouched.
pub fn init_forced_ids(config: &GenerationConfig, prompt_len: usize) -> GenerationResult<Option<Vec<(usize, u32)>>> {
    if !config.is_multilingual && config.language.is_none() && config.task.is_none() {
        return Ok(None);
    }
    if !config.is_multilingual {
        return Err(GenerationError::config(
            "language and task need a multilingual checkpoint",
        ));
    }

    let mut tokens = Vec::new();
    if let Some(language) = &config.language {
        tokens.push(language_token(language, config.lang_to_id.as_ref())?);
    }
    let task = config.task.as_deref().unwrap_or("transcribe");
    tokens.push(task_token(task, config.task_to_id.as_ref())?);
    if !config.return_timestamps {
        if let Some(no_timestamps) = config.no_timestamps_token_id {
            tokens.push(no_timestamps);
        }
    }

    Ok(Some(
        tokens
            .into_iter()
            .enumerate()
            .map(|(offset, token)| (prompt_len + offset, token))
            .collect(),
    ))
}

/// Places `prompt_ids` in front of every row of `input_ids`.
pub fn with_prompt_ids(input_ids: &Array2<u32>, prompt_ids: Option<&[u32]>) -> GenerationResult<Array2<u32>> {
    let Some(prompt) = prompt_ids.filter(|ids| !ids.is_empty()) else {
        return Ok(input_ids.clone());
    };
    let rows = input_ids.nrows();
    let context = Array2::from_shape_fn((rows, prompt.len()), |(_, c)| prompt[c]);
    concatenate(Axis(1), &[context.view(), input_ids.view()])
        .map_err(|e| GenerationError::config(format!("cannot prepend prompt_ids: {}", e)))
}
