//! First-match lexical association between a cluster and the catalog.

use std::iter;

use coa_core::CatalogItem;

/// Return the first catalog item, in supplied order, with any term that
/// either appears inside the joined cluster text or contains the first word
/// of that text. Empty terms never match.
pub fn match_catalog_item<'a, S: AsRef<str>>(
    queries: &[S],
    catalog: &'a [CatalogItem],
) -> Option<&'a CatalogItem> {
    let keyword_text = queries
        .iter()
        .map(|q| q.as_ref().to_lowercase())
        .collect::<Vec<_>>()
        .join(" ");
    let first_word = keyword_text.split_whitespace().next();

    catalog.iter().find(|item| {
        catalog_terms(item).any(|term| term_matches(&keyword_text, first_word, &term))
    })
}

fn catalog_terms(item: &CatalogItem) -> impl Iterator<Item = String> + '_ {
    iter::once(item.title.to_lowercase())
        .chain(iter::once(item.handle.to_lowercase()))
        .chain(item.tags.iter().map(|tag| tag.to_lowercase()))
}

/// Plain substring containment would let an empty term match every cluster;
/// empty terms are treated as never matching instead.
fn term_matches(keyword_text: &str, first_word: Option<&str>, term: &str) -> bool {
    if term.is_empty() {
        return false;
    }
    keyword_text.contains(term) || first_word.is_some_and(|word| term.contains(word))
}
