//! Path selectors over [`Document`]s: a small XPath subset.
//!
//! Supported syntax:
//! - `/iq/query` absolute steps from the document node (`iq/query` is the same)
//! - `//item` any descendant, `/iq//item` any descendant of `iq`
//! - `*` matches any element name
//! - predicates: `[@type]`, `[@type='result']`, `[@type="result"]`, `[2]` (1-based)
//!
//! Names are compared as written on the wire, prefix included
//! (`stream:features`).

use crate::error::{Error, Result};

use super::{Document, Element};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Axis {
    Child,
    Descendant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum NameTest {
    Any,
    Name(String),
}

impl NameTest {
    fn matches(&self, el: &Element) -> bool {
        match self {
            NameTest::Any => true,
            NameTest::Name(name) => el.name() == name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Predicate {
    HasAttr(String),
    AttrEquals(String, String),
    Position(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Step {
    axis: Axis,
    test: NameTest,
    predicates: Vec<Predicate>,
}

/// A parsed path expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
    steps: Vec<Step>,
}

/// Splits off the next step, stopping at a `/` outside brackets and quotes.
/// The remainder, if any, starts with that `/`.
fn split_step(input: &str) -> (&str, Option<&str>) {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    for (idx, ch) in input.char_indices() {
        match (quote, ch) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'') | (None, '"') => quote = Some(ch),
            (None, '[') => depth += 1,
            (None, ']') => depth = depth.saturating_sub(1),
            (None, '/') if depth == 0 => return (&input[..idx], Some(&input[idx..])),
            _ => {}
        }
    }
    (input, None)
}

fn is_name_char(ch: char) -> bool {
    ch.is_alphanumeric() || matches!(ch, '_' | '-' | '.' | ':')
}

impl Path {
    pub fn parse(expression: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidPath {
            expression: expression.to_string(),
            reason: reason.to_string(),
        };

        let mut rest = expression.trim();
        if rest.is_empty() {
            return Err(invalid("empty expression"));
        }

        let mut axis = Axis::Child;
        if let Some(after) = rest.strip_prefix("//") {
            axis = Axis::Descendant;
            rest = after;
        } else if let Some(after) = rest.strip_prefix('/') {
            rest = after;
        }

        let mut steps = Vec::new();
        loop {
            let (step_text, remainder) = split_step(rest);
            if step_text.trim().is_empty() {
                return Err(invalid("empty step"));
            }
            steps.push(Self::parse_step(axis, step_text.trim()).map_err(|reason| invalid(&reason))?);

            match remainder {
                None => break,
                Some(next) => {
                    if let Some(after) = next.strip_prefix("//") {
                        axis = Axis::Descendant;
                        rest = after;
                    } else {
                        axis = Axis::Child;
                        rest = &next[1..];
                    }
                }
            }
        }

        Ok(Path { steps })
    }

    fn parse_step(axis: Axis, text: &str) -> std::result::Result<Step, String> {
        let name_end = text.find('[').unwrap_or(text.len());
        let name = &text[..name_end];
        let test = if name == "*" {
            NameTest::Any
        } else if !name.is_empty() && name.chars().all(is_name_char) {
            NameTest::Name(name.to_string())
        } else {
            return Err(format!("invalid name test `{}`", name));
        };

        let mut predicates = Vec::new();
        let mut rest = &text[name_end..];
        while let Some(open) = rest.strip_prefix('[') {
            let mut quote: Option<char> = None;
            let close = open.char_indices().find_map(|(idx, ch)| match (quote, ch) {
                (Some(q), c) if c == q => {
                    quote = None;
                    None
                }
                (Some(_), _) => None,
                (None, '\'') | (None, '"') => {
                    quote = Some(ch);
                    None
                }
                (None, ']') => Some(idx),
                _ => None,
            });
            let close = close.ok_or_else(|| "unclosed predicate".to_string())?;
            predicates.push(Self::parse_predicate(open[..close].trim())?);
            rest = &open[close + 1..];
        }
        if !rest.trim().is_empty() {
            return Err(format!("unexpected `{}` after step", rest));
        }

        Ok(Step {
            axis,
            test,
            predicates,
        })
    }

    fn parse_predicate(text: &str) -> std::result::Result<Predicate, String> {
        if let Some(attr) = text.strip_prefix('@') {
            return match attr.split_once('=') {
                Some((key, value)) => {
                    let key = key.trim();
                    let value = value.trim();
                    let unquoted = value
                        .strip_prefix('\'')
                        .and_then(|v| v.strip_suffix('\''))
                        .or_else(|| value.strip_prefix('"').and_then(|v| v.strip_suffix('"')))
                        .ok_or_else(|| format!("attribute value must be quoted: {}", value))?;
                    if key.is_empty() || !key.chars().all(is_name_char) {
                        return Err(format!("invalid attribute name `{}`", key));
                    }
                    Ok(Predicate::AttrEquals(key.to_string(), unquoted.to_string()))
                }
                None if !attr.is_empty() && attr.chars().all(is_name_char) => {
                    Ok(Predicate::HasAttr(attr.to_string()))
                }
                None => Err(format!("invalid attribute name `{}`", attr)),
            };
        }

        match text.parse::<usize>() {
            Ok(position) if position >= 1 => Ok(Predicate::Position(position)),
            _ => Err(format!("unsupported predicate `{}`", text)),
        }
    }

    /// All matching elements. Duplicates reached through overlapping
    /// descendant steps are returned once.
    pub fn select_all<'d>(&self, doc: &'d Document) -> Vec<&'d Element> {
        let root = doc.root();
        // `None` stands for the document node above the root element.
        let mut context: Vec<Option<&'d Element>> = vec![None];

        for step in &self.steps {
            let mut next: Vec<&'d Element> = Vec::new();
            for ctx in &context {
                let candidates = candidates(root, *ctx, step.axis);
                let mut matched: Vec<&'d Element> = candidates
                    .into_iter()
                    .filter(|el| step.test.matches(el))
                    .collect();
                for predicate in &step.predicates {
                    matched = match predicate {
                        Predicate::Position(n) => matched.get(n - 1).copied().into_iter().collect(),
                        Predicate::HasAttr(key) => {
                            matched.into_iter().filter(|el| el.attr(key).is_some()).collect()
                        }
                        Predicate::AttrEquals(key, value) => matched
                            .into_iter()
                            .filter(|el| el.attr(key) == Some(value.as_str()))
                            .collect(),
                    };
                }
                for el in matched {
                    if !next.iter().any(|seen| std::ptr::eq(*seen, el)) {
                        next.push(el);
                    }
                }
            }
            context = next.into_iter().map(Some).collect();
        }

        context.into_iter().flatten().collect()
    }

    pub fn select_single<'d>(&self, doc: &'d Document) -> Option<&'d Element> {
        self.select_all(doc).into_iter().next()
    }
}

fn candidates<'d>(root: &'d Element, ctx: Option<&'d Element>, axis: Axis) -> Vec<&'d Element> {
    match (ctx, axis) {
        (None, Axis::Child) => vec![root],
        (None, Axis::Descendant) => {
            let mut out = vec![root];
            collect_descendants(root, &mut out);
            out
        }
        (Some(el), Axis::Child) => el.children().collect(),
        (Some(el), Axis::Descendant) => {
            let mut out = Vec::new();
            collect_descendants(el, &mut out);
            out
        }
    }
}

fn collect_descendants<'d>(el: &'d Element, out: &mut Vec<&'d Element>) {
    for child in el.children() {
        out.push(child);
        collect_descendants(child, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roster() -> Document {
        Document::parse(
            "<iq type='result' id='r1'>\
               <query xmlns='jabber:iq:roster'>\
                 <item jid='alice@example.com' subscription='both'><group>Friends</group></item>\
                 <item jid='bob@example.com' subscription='to'/>\
                 <item jid='carol@example.com' subscription='both'><group>Work</group></item>\
               </query>\
             </iq>",
        )
        .unwrap()
    }

    #[test]
    fn test_absolute_path() {
        let doc = roster();
        let query = doc.select_single("/iq/query").unwrap().unwrap();
        assert_eq!(query.attr("xmlns"), Some("jabber:iq:roster"));
        assert_eq!(doc.select_all("/iq/query/item").unwrap().len(), 3);
    }

    #[test]
    fn test_relative_path_starts_at_document() {
        let doc = roster();
        assert_eq!(doc.select_all("iq/query/item").unwrap().len(), 3);
        assert!(doc.select_single("query").unwrap().is_none());
    }

    #[test]
    fn test_root_name_mismatch() {
        let doc = roster();
        assert!(doc.select_single("/message/body").unwrap().is_none());
    }

    #[test]
    fn test_descendant_axis() {
        let doc = roster();
        let groups: Vec<String> = doc
            .select_all("//group")
            .unwrap()
            .into_iter()
            .map(|el| el.text())
            .collect();
        assert_eq!(groups, vec!["Friends", "Work"]);
        assert_eq!(doc.select_all("/iq//item").unwrap().len(), 3);
        assert_eq!(doc.select_single("//iq").unwrap().unwrap().name(), "iq");
    }

    #[test]
    fn test_attribute_predicates() {
        let doc = roster();
        let both = doc.select_all("//item[@subscription='both']").unwrap();
        assert_eq!(both.len(), 2);
        let bob = doc
            .select_single(r#"//item[@jid="bob@example.com"]"#)
            .unwrap()
            .unwrap();
        assert_eq!(bob.attr("subscription"), Some("to"));
        assert_eq!(doc.select_all("/iq[@id]").unwrap().len(), 1);
        assert!(doc.select_all("/iq[@from]").unwrap().is_empty());
    }

    #[test]
    fn test_position_predicate() {
        let doc = roster();
        let second = doc.select_single("/iq/query/item[2]").unwrap().unwrap();
        assert_eq!(second.attr("jid"), Some("bob@example.com"));
        assert!(doc.select_single("/iq/query/item[4]").unwrap().is_none());
        let second_both = doc
            .select_single("//item[@subscription='both'][2]")
            .unwrap()
            .unwrap();
        assert_eq!(second_both.attr("jid"), Some("carol@example.com"));
    }

    #[test]
    fn test_wildcard() {
        let doc = roster();
        assert_eq!(doc.select_all("/*/*/*").unwrap().len(), 3);
        assert_eq!(doc.select_all("/iq/*").unwrap().len(), 1);
    }

    #[test]
    fn test_prefixed_names() {
        let doc = Document::parse(
            "<stream:features xmlns:stream='http://etherx.jabber.org/streams'><starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'><required/></starttls></stream:features>",
        )
        .unwrap();
        assert!(doc
            .select_single("/stream:features/starttls/required")
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_quoted_slash_in_predicate() {
        let doc = Document::parse("<message from='a@b/res'><body>x</body></message>").unwrap();
        let msg = doc.select_single("/message[@from='a@b/res']").unwrap();
        assert!(msg.is_some());
    }

    #[test]
    fn test_invalid_expressions() {
        for expression in ["", "/", "//", "/iq//", "/iq/[1]", "/iq[", "/iq[0]", "/iq[@]", "/iq[@a=b]", "/i q"] {
            let err = Path::parse(expression).unwrap_err();
            assert_eq!(err.kind(), crate::ErrorKind::InvalidPath, "{}", expression);
        }
    }
}
