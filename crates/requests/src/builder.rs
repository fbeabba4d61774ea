//! Composes fully-resolved request descriptors from user input.
//!
//! Each mode validates its inputs and produces the ordered batch the
//! scheduler consumes; the scheduler itself never re-validates.

use thiserror::Error;

use crate::{AspectRatio, ImageLibrary, RequestDescriptor};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("no uploaded images to work with")]
    NoImages,

    #[error("prompt must not be empty")]
    EmptyPrompt,

    #[error("no image has a non-empty prompt")]
    NoUsablePrompts,

    #[error("character description must not be empty")]
    EmptyCharacter,

    #[error("style must not be empty")]
    EmptyStyle,
}

/// Wraps edit instructions so the subject's appearance is preserved across
/// the edit.
fn edit_prompt(changes: &str) -> String {
    format!(
        "Maintain the visual appearance of the character from the uploaded image. \
         Apply the following changes: {changes}"
    )
}

/// One shared prompt applied to every uploaded image, one edit request per
/// image in upload order.
pub fn image_edit_batch(
    library: &ImageLibrary,
    prompt: &str,
) -> Result<Vec<RequestDescriptor>, BuildError> {
    let prompt = prompt.trim();
    if prompt.is_empty() {
        return Err(BuildError::EmptyPrompt);
    }
    if library.is_empty() {
        return Err(BuildError::NoImages);
    }

    let resolved = edit_prompt(prompt);
    Ok(library
        .ids()
        .into_iter()
        .map(|id| RequestDescriptor::image_edit(id, resolved.clone()))
        .collect())
}

/// A different prompt per image. Pairs with a blank prompt are skipped; at
/// least one usable pair is required.
pub fn per_image_batch(pairs: &[(u64, String)]) -> Result<Vec<RequestDescriptor>, BuildError> {
    if pairs.is_empty() {
        return Err(BuildError::NoImages);
    }

    let descriptors: Vec<RequestDescriptor> = pairs
        .iter()
        .filter(|(_, prompt)| !prompt.trim().is_empty())
        .map(|(id, prompt)| RequestDescriptor::image_edit(*id, edit_prompt(prompt.trim())))
        .collect();

    if descriptors.is_empty() {
        return Err(BuildError::NoUsablePrompts);
    }
    Ok(descriptors)
}

/// A character description, an action and a style, composed into one edit
/// request per uploaded image.
pub fn character_batch(
    library: &ImageLibrary,
    character: &str,
    action: &str,
    style: &str,
) -> Result<Vec<RequestDescriptor>, BuildError> {
    let character = character.trim();
    let action = action.trim();
    let style = style.trim();
    if character.is_empty() {
        return Err(BuildError::EmptyCharacter);
    }
    if action.is_empty() {
        return Err(BuildError::EmptyPrompt);
    }
    if style.is_empty() {
        return Err(BuildError::EmptyStyle);
    }
    if library.is_empty() {
        return Err(BuildError::NoImages);
    }

    let resolved = format!(
        "The character in the image is best described as: '{character}'. \
         Now, maintaining the character's core appearance from the image, \
         depict them {action}. The overall style should be {style}."
    );
    Ok(library
        .ids()
        .into_iter()
        .map(|id| RequestDescriptor::image_edit(id, resolved.clone()))
        .collect())
}

/// A single video request from a prompt, an aspect ratio and an optional
/// reference image.
pub fn video_batch(
    prompt: &str,
    aspect_ratio: AspectRatio,
    source_image_id: Option<u64>,
) -> Result<Vec<RequestDescriptor>, BuildError> {
    let prompt = prompt.trim();
    if prompt.is_empty() {
        return Err(BuildError::EmptyPrompt);
    }
    Ok(vec![RequestDescriptor::video(
        prompt.to_string(),
        aspect_ratio,
        source_image_id,
    )])
}
