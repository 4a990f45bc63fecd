//! Text and facet canonicalization shared by indexing, query rewriting and search.
//!
//! Every comparison between a shopper's input and a catalog value goes through
//! one of these functions, so they must be idempotent: canonicalizing an
//! already-canonical value returns it unchanged.

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use std::collections::HashMap;
use unicode_normalization::{char::is_combining_mark, UnicodeNormalization};

/// Occasion slugs that collapse onto a single canonical slug.
static OCCASION_SYNONYMS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("black-tie", "gala"),
        ("blacktie", "gala"),
        ("gala-black-tie", "gala"),
        ("black-tie-gala", "gala"),
        ("festa-de-gala", "gala"),
        ("mae-dos-noivos", "mae-dos-noivos"),
        ("mae-dos-noivas", "mae-dos-noivos"),
        ("mae-do-noivo", "mae-dos-noivos"),
        ("mae-da-noiva", "mae-dos-noivos"),
        ("mae-de-noiva", "mae-dos-noivos"),
        ("mae-de-noivo", "mae-dos-noivos"),
        ("madrinhas", "madrinha"),
        ("formaturas", "formatura"),
        ("convidadas", "convidada"),
        ("debutantes", "debutante"),
        ("noivas", "noiva"),
        ("casamento-civil", "civil"),
    ])
});

/// Commercial color words that name a base hue other than themselves.
static BASE_HUE_ALIASES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("marinho", "azul"),
        ("serenity", "azul"),
        ("tiffany", "azul"),
        ("royal", "azul"),
        ("esmeralda", "verde"),
        ("oliva", "verde"),
        ("menta", "verde"),
        ("jade", "verde"),
        ("marsala", "vinho"),
        ("bordo", "vinho"),
        ("burgundy", "vinho"),
        ("rose", "rosa"),
        ("pink", "rosa"),
        ("fucsia", "rosa"),
        ("pink-claro", "rosa"),
        ("lavanda", "lilas"),
        ("lilac", "lilas"),
        ("roxo", "lilas"),
        ("champagne", "nude"),
        ("bege", "nude"),
        ("off-white", "branco"),
        ("offwhite", "branco"),
        ("marfim", "branco"),
        ("perola", "branco"),
        ("ouro", "dourado"),
        ("gold", "dourado"),
        ("prateado", "prata"),
        ("silver", "prata"),
        ("coral", "laranja"),
        ("terracota", "laranja"),
        ("mostarda", "amarelo"),
        ("black", "preto"),
        ("white", "branco"),
        ("red", "vermelho"),
        ("blue", "azul"),
        ("green", "verde"),
    ])
});

/// Base hues recognised as the leading word of a commercial color name.
const BASE_HUES: &[&str] = &[
    "azul", "verde", "vermelho", "rosa", "preto", "branco", "nude", "dourado", "prata",
    "lilas", "amarelo", "laranja", "vinho", "cinza", "marrom", "estampado",
];

fn strip_marks(text: &str) -> String {
    text.nfkd().filter(|c| !is_combining_mark(*c)).collect()
}

/// Accent-fold, lowercase and collapse whitespace.
///
/// `"  Vestido AZUL   Royal "` becomes `"vestido azul royal"`.
pub fn fold_text(text: &str) -> String {
    // Lowercasing can reintroduce combining marks (e.g. U+0130), so strip twice.
    let folded = strip_marks(&strip_marks(text).to_lowercase());
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Fold and replace every run of non `[a-z0-9]` characters with a single hyphen.
pub fn slugify(text: &str) -> String {
    let folded = fold_text(text);
    let mut slug = String::with_capacity(folded.len());
    let mut pending_hyphen = false;

    for c in folded.chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            if pending_hyphen && !slug.is_empty() {
                slug.push('-');
            }
            pending_hyphen = false;
            slug.push(c);
        } else {
            pending_hyphen = true;
        }
    }

    slug
}

/// Canonical occasion slug: slugified, then mapped through the synonym table.
///
/// `"Black Tie"` and `"Gala"` both become `"gala"`.
pub fn canonical_occasion(value: &str) -> String {
    let slug = slugify(value);
    match OCCASION_SYNONYMS.get(slug.as_str()) {
        Some(canonical) => canonical.to_string(),
        None => slug,
    }
}

/// Canonical color name. Keeps inner spaces so `"Azul Royal"` stays two words.
pub fn canonical_color(value: &str) -> String {
    fold_text(&value.replace(['_', '/'], " "))
}

/// Base hue of a (commercial) color name, when one can be recognised.
///
/// Several commercial names map onto one base hue: `"azul royal"`,
/// `"azul serenity"` and `"marinho"` all resolve to `"azul"`.
pub fn base_hue(value: &str) -> Option<String> {
    let color = canonical_color(value);
    if color.is_empty() {
        return None;
    }

    let hyphenated = color.replace(' ', "-");
    if let Some(alias) = BASE_HUE_ALIASES.get(hyphenated.as_str()) {
        return Some(alias.to_string());
    }

    for word in color.split(' ') {
        if BASE_HUES.contains(&word) {
            return Some(word.to_string());
        }
    }
    color
        .split(' ')
        .find_map(|word| BASE_HUE_ALIASES.get(word).map(|hue| hue.to_string()))
}

/// Canonical size label: folded, whitespace removed, uppercase (`" pp "` → `"PP"`).
pub fn canonical_size(value: &str) -> String {
    fold_text(value)
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_uppercase()
}

/// Canonicalize every value with `canon`, dropping the ones that end up empty.
pub fn canonical_set<I, S>(values: I, canon: fn(&str) -> String) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    values
        .into_iter()
        .map(|v| canon(v.as_ref()))
        .filter(|v| !v.is_empty())
        .collect()
}
