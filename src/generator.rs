//! Facet and copy generation for catalog items with a vision-capable model.

use std::sync::Arc;

use crate::facets::{FacetKind, Facets};
use crate::images::{prepare_for_vision, ImageError, ImageSource};
use crate::inventory::InventoryItem;
use crate::llm::{extract_json_object, string_field, string_list, ChatModel, ChatRequest, LlmError};
use crate::vocabulary::VocabularyDigest;

const VISION_SYSTEM_PROMPT: &str = "Você é um especialista em moda que cataloga vestidos de aluguel. \
Analise a foto e responda somente com um objeto JSON com as chaves: \
description (até 50 palavras, português do Brasil, objetiva: cor, tecido, modelagem, decote, mangas, ocasião), \
title (até 5 palavras, sem aspas), occasions, colors, fabrics, silhouette, neckline, sleeves, details, keywords. \
Todas as chaves exceto description e title são listas de strings curtas em minúsculas. \
O vocabulário fornecido lista valores já usados no catálogo: prefira-os quando se aplicarem, \
mas use outro valor se nenhum descrever a peça.";

const COPY_SYSTEM_PROMPT: &str = "Você é redatora de uma loja de aluguel de vestidos de festa. \
Reescreva título e descrição em tom elegante, acolhedor e direto, sem inventar características. \
Responda somente com JSON: {\"title\": \"...\", \"description\": \"...\"}.";

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("item has no image")]
    MissingImage,

    #[error("image error: {0}")]
    Image(#[from] ImageError),

    #[error("model call failed: {0}")]
    Llm(#[from] LlmError),

    #[error("model output is not a JSON object: {0}")]
    Malformed(String),

    #[error("model output has no {0}")]
    MissingField(&'static str),
}

/// Title, description and facets produced for one item.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeneratedMetadata {
    pub title: String,
    pub description: String,
    pub facets: Facets,
    pub keywords: Vec<String>,
    /// False when existing copy was passed through without a model call.
    pub model_called: bool,
}

#[derive(Debug, Clone)]
pub struct GeneratorOptions {
    pub vision_model: String,
    pub copy_model: String,
    /// Call the model even when title and description exist
    pub force: bool,
    /// Second pass rewriting title and description in the house tone
    pub copywriting: bool,
    pub image_max_dimension: u32,
}

pub struct MetadataGenerator {
    chat: Arc<dyn ChatModel>,
    images: Arc<dyn ImageSource>,
    options: GeneratorOptions,
}

fn present(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

impl MetadataGenerator {
    pub fn new(chat: Arc<dyn ChatModel>, images: Arc<dyn ImageSource>, options: GeneratorOptions) -> Self {
        Self {
            chat,
            images,
            options,
        }
    }

    /// Whether generating for this copy would call the model.
    pub fn needs_model(&self, existing_description: Option<&str>, existing_title: Option<&str>) -> bool {
        self.options.force
            || present(existing_description).is_none()
            || present(existing_title).is_none()
    }

    /// Fetch the item's image when needed and generate its metadata.
    pub fn generate_for(
        &self,
        item: &InventoryItem,
        hints: &VocabularyDigest,
    ) -> Result<GeneratedMetadata, GenerationError> {
        let description = Some(item.description.as_str());
        let title = Some(item.title.as_str());

        if !self.needs_model(description, title) {
            return self.generate(&[], description, title, hints);
        }

        let reference = item
            .image
            .as_deref()
            .filter(|r| !r.trim().is_empty())
            .ok_or(GenerationError::MissingImage)?;
        let bytes = self.images.fetch(reference)?;
        self.generate(&bytes, description, title, hints)
    }

    /// Derive description, title and facets from an image.
    ///
    /// Existing description and title pass through untouched (no model call)
    /// unless regeneration is forced.
    pub fn generate(
        &self,
        image: &[u8],
        existing_description: Option<&str>,
        existing_title: Option<&str>,
        hints: &VocabularyDigest,
    ) -> Result<GeneratedMetadata, GenerationError> {
        if !self.needs_model(existing_description, existing_title) {
            return Ok(GeneratedMetadata {
                title: present(existing_title).unwrap_or_default().to_string(),
                description: present(existing_description).unwrap_or_default().to_string(),
                ..Default::default()
            });
        }

        if image.is_empty() {
            return Err(GenerationError::MissingImage);
        }
        let prepared = prepare_for_vision(image, self.options.image_max_dimension)?;

        let mut user = format!("Vocabulário do catálogo: {}", hints.to_prompt_json());
        if let Some(title) = present(existing_title) {
            user.push_str(&format!("\nTítulo atual: {title}"));
        }
        if let Some(description) = present(existing_description) {
            user.push_str(&format!("\nDescrição atual: {description}"));
        }

        let request = ChatRequest::new(&self.options.vision_model, VISION_SYSTEM_PROMPT, user)
            .with_image(prepared.to_data_url());
        let output = self.chat.complete(&request)?;
        let mut generated = parse_vision_output(&output)?;

        // Existing copy wins unless regeneration was forced
        if !self.options.force {
            if let Some(title) = present(existing_title) {
                generated.title = title.to_string();
            }
            if let Some(description) = present(existing_description) {
                generated.description = description.to_string();
            }
        }

        if self.options.copywriting {
            self.rewrite_copy(&mut generated);
        }

        Ok(generated)
    }

    /// Copywriting pass. Facets are never touched; failures keep the first-pass copy.
    fn rewrite_copy(&self, generated: &mut GeneratedMetadata) {
        let user = format!(
            "Título: {}\nDescrição: {}",
            generated.title, generated.description
        );
        let request = ChatRequest::new(&self.options.copy_model, COPY_SYSTEM_PROMPT, user);

        let rewritten = self
            .chat
            .complete(&request)
            .map_err(|e| e.to_string())
            .and_then(|output| {
                extract_json_object(&output).ok_or_else(|| "not a JSON object".to_string())
            });

        match rewritten {
            Ok(map) => {
                if let Some(title) = string_field(&map, "title") {
                    generated.title = clean_title(&title);
                }
                if let Some(description) = string_field(&map, "description") {
                    generated.description = description;
                }
            }
            Err(err) => log::warn!("copywriting pass failed, keeping generated copy: {}", err),
        }
    }
}

fn clean_title(title: &str) -> String {
    title.replace(['"', '“', '”'], "").trim().to_string()
}

fn parse_vision_output(output: &str) -> Result<GeneratedMetadata, GenerationError> {
    let map = extract_json_object(output)
        .ok_or_else(|| GenerationError::Malformed(output.chars().take(200).collect()))?;

    let description = string_field(&map, "description").ok_or(GenerationError::MissingField("description"))?;
    let title = string_field(&map, "title").ok_or(GenerationError::MissingField("title"))?;

    let mut facets = Facets::default();
    for kind in FacetKind::ALL {
        facets.extend(kind, string_list(&map, kind.name()));
    }

    Ok(GeneratedMetadata {
        title: clean_title(&title),
        description,
        facets,
        keywords: string_list(&map, "keywords"),
        model_called: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct ScriptedChat {
        replies: Mutex<Vec<Result<String, LlmError>>>,
        calls: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedChat {
        fn new(replies: Vec<Result<String, LlmError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies),
                calls: Mutex::new(vec![]),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    impl ChatModel for ScriptedChat {
        fn complete(&self, request: &ChatRequest) -> Result<String, LlmError> {
            self.calls.lock().unwrap().push(request.clone());
            let mut replies = self.replies.lock().unwrap();
            if replies.is_empty() {
                return Err(LlmError::Malformed("no scripted reply".to_string()));
            }
            replies.remove(0)
        }
    }

    struct NoImages;

    impl ImageSource for NoImages {
        fn fetch(&self, reference: &str) -> Result<Vec<u8>, ImageError> {
            Err(ImageError::NotAnImage(reference.to_string()))
        }
    }

    fn png() -> Vec<u8> {
        let img = image::RgbaImage::from_pixel(4, 4, image::Rgba([0, 0, 255, 255]));
        let mut buf = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    fn generator(chat: Arc<ScriptedChat>, force: bool, copywriting: bool) -> MetadataGenerator {
        MetadataGenerator::new(
            chat,
            Arc::new(NoImages),
            GeneratorOptions {
                vision_model: "vision".to_string(),
                copy_model: "copy".to_string(),
                force,
                copywriting,
                image_max_dimension: 256,
            },
        )
    }

    const VISION_REPLY: &str = r#"{"description": "Vestido longo azul royal em crepe", "title": "\"Vestido Aurora\"",
        "occasions": ["Madrinha", "Black Tie"], "colors": ["Azul Royal"], "fabrics": ["crepe"],
        "silhouette": ["sereia"], "neckline": [], "sleeves": "sem mangas", "details": [], "keywords": ["longo"]}"#;

    #[test]
    fn test_pass_through_without_model_call() {
        let chat = ScriptedChat::new(vec![]);
        let gen = generator(chat.clone(), false, false);

        let out = gen
            .generate(&[], Some("Longo azul"), Some("Vestido Ana"), &VocabularyDigest::default())
            .unwrap();
        assert_eq!(out.title, "Vestido Ana");
        assert_eq!(out.description, "Longo azul");
        assert!(!out.model_called);
        assert_eq!(chat.call_count(), 0);
    }

    #[test]
    fn test_generates_facets_from_image() {
        let chat = ScriptedChat::new(vec![Ok(VISION_REPLY.to_string())]);
        let gen = generator(chat.clone(), false, false);

        let out = gen.generate(&png(), None, None, &VocabularyDigest::default()).unwrap();
        assert!(out.model_called);
        assert_eq!(out.title, "Vestido Aurora");
        let occasions = out.facets.get(FacetKind::Occasions).unwrap();
        assert!(occasions.contains("madrinha") && occasions.contains("gala"));
        assert!(out.facets.get(FacetKind::Sleeves).unwrap().contains("sem mangas"));
        assert!(out.facets.get(FacetKind::Neckline).is_none());

        let calls = chat.calls.lock().unwrap();
        assert!(calls[0].image_url.as_deref().unwrap().starts_with("data:image/webp"));
    }

    #[test]
    fn test_existing_title_kept_when_only_description_missing() {
        let chat = ScriptedChat::new(vec![Ok(VISION_REPLY.to_string())]);
        let gen = generator(chat, false, false);

        let out = gen
            .generate(&png(), None, Some("Vestido Ana"), &VocabularyDigest::default())
            .unwrap();
        assert_eq!(out.title, "Vestido Ana");
        assert_eq!(out.description, "Vestido longo azul royal em crepe");
    }

    #[test]
    fn test_force_regenerates() {
        let chat = ScriptedChat::new(vec![Ok(VISION_REPLY.to_string())]);
        let gen = generator(chat.clone(), true, false);

        let out = gen
            .generate(&png(), Some("x"), Some("y"), &VocabularyDigest::default())
            .unwrap();
        assert_eq!(out.title, "Vestido Aurora");
        assert_eq!(chat.call_count(), 1);
    }

    #[test]
    fn test_json_embedded_in_prose_is_recovered() {
        let reply = format!("Segue a análise:\n```json\n{VISION_REPLY}\n```");
        let chat = ScriptedChat::new(vec![Ok(reply)]);
        let out = generator(chat, false, false)
            .generate(&png(), None, None, &VocabularyDigest::default())
            .unwrap();
        assert_eq!(out.title, "Vestido Aurora");
    }

    #[test]
    fn test_malformed_output_fails() {
        let chat = ScriptedChat::new(vec![Ok("desculpe, não consigo".to_string())]);
        let result = generator(chat, false, false).generate(&png(), None, None, &VocabularyDigest::default());
        assert!(matches!(result, Err(GenerationError::Malformed(_))));
    }

    #[test]
    fn test_missing_image() {
        let chat = ScriptedChat::new(vec![]);
        let result = generator(chat, false, false).generate(&[], None, None, &VocabularyDigest::default());
        assert!(matches!(result, Err(GenerationError::MissingImage)));
    }

    #[test]
    fn test_copywriting_keeps_facets() {
        let chat = ScriptedChat::new(vec![
            Ok(VISION_REPLY.to_string()),
            Ok(r#"{"title": "Aurora Royal", "description": "Um longo deslumbrante."}"#.to_string()),
        ]);
        let out = generator(chat.clone(), false, true)
            .generate(&png(), None, None, &VocabularyDigest::default())
            .unwrap();

        assert_eq!(out.title, "Aurora Royal");
        assert_eq!(out.description, "Um longo deslumbrante.");
        assert!(out.facets.get(FacetKind::Silhouette).unwrap().contains("sereia"));
        assert_eq!(chat.call_count(), 2);
    }

    #[test]
    fn test_copywriting_failure_keeps_first_pass() {
        let chat = ScriptedChat::new(vec![Ok(VISION_REPLY.to_string())]);
        let out = generator(chat, false, true)
            .generate(&png(), None, None, &VocabularyDigest::default())
            .unwrap();
        assert_eq!(out.title, "Vestido Aurora");
    }

    #[test]
    fn test_generate_for_fetch_failure() {
        let chat = ScriptedChat::new(vec![]);
        let item = InventoryItem {
            id: "1".to_string(),
            image: Some("a.png".to_string()),
            ..Default::default()
        };
        let result = generator(chat, false, false).generate_for(&item, &VocabularyDigest::default());
        assert!(matches!(result, Err(GenerationError::Image(_))));
    }
}
