//! Free-text query cleanup and FTS5 rendering.

use crate::storage::sqlite::fold_for_search;
use std::fmt;

/// Cleans one user fragment into space-separated index terms.
///
/// Letters and digits are kept. A `-` is kept only right after whitespace
/// (negation); every other character ends the current token. A token ending
/// in a letter or digit gets a trailing `*` so it matches as a prefix.
/// Output is folded like the index text: accents stripped, lower-cased,
/// and ideographs or kana split into one token each.
///
/// # Examples
///
/// ```rust
/// use shelfstore::storage::search::clean_fragment;
///
/// assert_eq!(clean_fragment("Dune: Messiah"), "dune* messiah*");
/// assert_eq!(clean_fragment("tolkien -silmarillion"), "tolkien* -silmarillion*");
/// assert_eq!(clean_fragment("!!!"), "");
/// ```
#[must_use]
pub fn clean_fragment(input: &str) -> String {
    let folded = fold_for_search(input);
    let mut out = String::with_capacity(folded.len() + 8);
    let mut prev = ' ';

    for c in folded.chars() {
        if c.is_alphanumeric() {
            out.push(c);
            prev = c;
        } else if c == '-' && prev.is_whitespace() {
            out.push(c);
            prev = c;
        } else {
            if !prev.is_whitespace() {
                if prev.is_alphanumeric() {
                    out.push('*');
                }
                out.push(' ');
            }
            prev = ' ';
        }
    }
    if prev.is_alphanumeric() {
        out.push('*');
    }
    out.trim_end().to_string()
}

/// Index column a term is restricted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Anywhere,
    Author,
    Title,
}

impl Scope {
    const fn prefix(self) -> &'static str {
        match self {
            Self::Anywhere => "",
            Self::Author => "author_name:",
            Self::Title => "title:",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Term {
    scope: Scope,
    text: String,
}

/// A cleaned search, ready to bind to `MATCH`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtsQuery {
    positive: Vec<Term>,
    negative: Vec<Term>,
}

impl FtsQuery {
    /// Builds a query from up to three fragments.
    ///
    /// Returns `None` ("no query") when cleanup leaves no positive term.
    /// Negated terms alone cannot form an FTS5 query.
    #[must_use]
    pub fn build(author: Option<&str>, title: Option<&str>, keywords: Option<&str>) -> Option<Self> {
        let mut query = Self {
            positive: Vec::new(),
            negative: Vec::new(),
        };
        for (scope, fragment) in [
            (Scope::Anywhere, keywords),
            (Scope::Author, author),
            (Scope::Title, title),
        ] {
            let Some(fragment) = fragment else { continue };
            for token in clean_fragment(fragment).split_whitespace() {
                match token.strip_prefix('-') {
                    Some(negated) => {
                        let negated = negated.trim_start_matches('-');
                        if !negated.is_empty() {
                            query.negative.push(Term {
                                scope,
                                text: negated.to_string(),
                            });
                        }
                    },
                    None => query.positive.push(Term {
                        scope,
                        text: token.to_string(),
                    }),
                }
            }
        }
        if query.positive.is_empty() {
            None
        } else {
            Some(query)
        }
    }

    /// Number of positive terms.
    #[must_use]
    pub fn term_count(&self) -> usize {
        self.positive.len()
    }
}

impl fmt::Display for FtsQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for term in &self.positive {
            if !first {
                f.write_str(" ")?;
            }
            first = false;
            write!(f, "{}{}", term.scope.prefix(), term.text)?;
        }
        for term in &self.negative {
            write!(f, " NOT {}{}", term.scope.prefix(), term.text)?;
        }
        Ok(())
    }
}
