//! Content sanitization and moderation.
//!
//! Message text is rendered as rich text by clients, so all markup except a
//! small inline allow-list is stripped before anything else looks at it.
//! Raw-text elements such as `<script>` are removed together with their
//! contents. The moderator then judges the plain text, with character
//! references decoded so `sp&#97;m` reads as `spam`.

use async_trait::async_trait;
use std::collections::BTreeSet;
use tracing::debug;

/// Tags kept by the sanitizer. Attributes are always dropped.
pub const ALLOWED_TAGS: [&str; 5] = ["b", "i", "em", "strong", "br"];

/// Elements removed together with everything up to their closing tag.
const RAW_TEXT_TAGS: [&str; 9] = [
    "script", "style", "iframe", "object", "embed", "noscript", "template", "textarea", "title",
];

/// Sanitize user-supplied markup.
#[must_use]
pub fn sanitize(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(pos) = rest.find(['<', '>', '&']) {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];

        match tail.as_bytes()[0] {
            b'>' => {
                out.push_str("&gt;");
                rest = &tail[1..];
            }
            b'&' => {
                if entity_len(tail).is_some() {
                    out.push('&');
                } else {
                    out.push_str("&amp;");
                }
                rest = &tail[1..];
            }
            _ => rest = consume_markup(tail, &mut out),
        }
    }

    out.push_str(rest);
    out
}

/// Strip the remaining allow-listed tags and decode character references,
/// leaving plain text.
#[must_use]
pub fn plain_text(sanitized: &str) -> String {
    let mut out = String::with_capacity(sanitized.len());
    let mut rest = sanitized;
    while let Some(start) = rest.find('<') {
        out.push_str(&rest[..start]);
        match rest[start..].find('>') {
            Some(end) => rest = &rest[start + end + 1..],
            None => {
                rest = "";
            }
        }
    }
    out.push_str(rest);
    html_escape::decode_html_entities(&out).into_owned()
}

/// Consume markup starting at `<`, appending whatever survives to `out`.
/// Returns the unconsumed remainder.
fn consume_markup<'a>(tail: &'a str, out: &mut String) -> &'a str {
    debug_assert!(tail.starts_with('<'));

    if let Some(comment) = tail.strip_prefix("<!--") {
        return match comment.find("-->") {
            Some(end) => &comment[end + 3..],
            None => "",
        };
    }

    let after = &tail[1..];
    let (closing, name_start) = match after.strip_prefix('/') {
        Some(stripped) => (true, stripped),
        None => (false, after),
    };

    let starts_tag = name_start
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic())
        || (!closing && after.starts_with('!'));
    if !starts_tag {
        out.push_str("&lt;");
        return after;
    }

    let Some(end) = tag_end(tail) else {
        out.push_str("&lt;");
        return after;
    };

    let name: String = name_start
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase();
    let remainder = &tail[end + 1..];

    if ALLOWED_TAGS.contains(&name.as_str()) {
        if name == "br" {
            out.push_str("<br>");
        } else if closing {
            out.push_str(&format!("</{name}>"));
        } else {
            out.push_str(&format!("<{name}>"));
        }
        return remainder;
    }

    if !closing && RAW_TEXT_TAGS.contains(&name.as_str()) {
        return skip_raw_text(remainder, &name);
    }

    remainder
}

/// Index of the `>` closing the tag at the start of `tail`, honoring quotes.
fn tag_end(tail: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (i, c) in tail.char_indices().skip(1) {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"') | (None, '\'') => quote = Some(c),
            (None, '>') => return Some(i),
            _ => {}
        }
    }
    None
}

/// Skip past `</name ...>`; an unterminated element swallows the rest.
fn skip_raw_text<'a>(rest: &'a str, name: &str) -> &'a str {
    let lower = rest.to_ascii_lowercase();
    let needle = format!("</{name}");
    let mut from = 0;
    while let Some(found) = lower[from..].find(&needle) {
        let at = from + found;
        let after_name = at + needle.len();
        let boundary = lower[after_name..]
            .chars()
            .next()
            .map_or(true, |c| c == '>' || c.is_whitespace() || c == '/');
        if boundary {
            return match rest[at..].find('>') {
                Some(end) => &rest[at + end + 1..],
                None => "",
            };
        }
        from = after_name;
    }
    ""
}

/// Length of a character reference at the start of `s`, like `&amp;` or `&#39;`.
fn entity_len(s: &str) -> Option<usize> {
    let body = s.strip_prefix('&')?;
    let end = body.find(';')?;
    if end == 0 || end > 10 {
        return None;
    }
    let name = &body[..end];
    let valid = match name.strip_prefix('#') {
        Some(num) => match num.strip_prefix(['x', 'X']) {
            Some(hex) => !hex.is_empty() && hex.chars().all(|c| c.is_ascii_hexdigit()),
            None => !num.is_empty() && num.chars().all(|c| c.is_ascii_digit()),
        },
        None => name.chars().all(|c| c.is_ascii_alphanumeric()),
    };
    valid.then_some(end + 2)
}

/// A moderation decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    Blocked(Option<String>),
}

impl Verdict {
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        matches!(self, Verdict::Blocked(_))
    }
}

/// Judges sanitized plain text against a content policy.
#[async_trait]
pub trait Moderator: Send + Sync {
    async fn evaluate(&self, text: &str) -> Verdict;
}

/// Default keywords blocked by [`KeywordModerator`].
pub const DEFAULT_BLOCKED_KEYWORDS: [&str; 3] = ["spam", "inappropriate", "harassment"];

/// Case-insensitive substring deny-list.
#[derive(Debug, Clone)]
pub struct KeywordModerator {
    keywords: BTreeSet<String>,
}

impl KeywordModerator {
    #[must_use]
    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            keywords: keywords
                .into_iter()
                .map(|k| k.as_ref().trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }

    #[must_use]
    pub fn keywords(&self) -> impl Iterator<Item = &str> {
        self.keywords.iter().map(String::as_str)
    }
}

impl Default for KeywordModerator {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCKED_KEYWORDS)
    }
}

#[async_trait]
impl Moderator for KeywordModerator {
    async fn evaluate(&self, text: &str) -> Verdict {
        let lower = text.to_lowercase();
        match self.keywords.iter().find(|k| lower.contains(k.as_str())) {
            Some(keyword) => {
                debug!(keyword = %keyword, "Content blocked by keyword");
                Verdict::Blocked(Some(format!("Contains inappropriate content: {keyword}")))
            }
            None => Verdict::Allowed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_stripped_with_contents() {
        assert_eq!(
            sanitize("ignore <script>evil()</script> this message"),
            "ignore  this message"
        );
        assert_eq!(sanitize("a<SCRIPT type=\"x\">b</script >c"), "ac");
        assert_eq!(sanitize("before<style>p{}</style>after"), "beforeafter");
    }

    #[test]
    fn test_allowed_tags_kept_without_attributes() {
        assert_eq!(sanitize("<b>bold</b> and <i>it</i>"), "<b>bold</b> and <i>it</i>");
        assert_eq!(sanitize("<strong onclick=\"x()\">s</strong>"), "<strong>s</strong>");
        assert_eq!(sanitize("line<br/>break"), "line<br>break");
        assert_eq!(sanitize("<EM>e</EM>"), "<em>e</em>");
    }

    #[test]
    fn test_other_tags_unwrapped() {
        assert_eq!(sanitize("<div class=\"a\">hi</div>"), "hi");
        assert_eq!(sanitize("<a href=\"javascript:x\">link</a>"), "link");
        assert_eq!(sanitize("<img src=x onerror=alert(1)>"), "");
        assert_eq!(sanitize("x<!-- hidden -->y"), "xy");
    }

    #[test]
    fn test_stray_brackets_escaped() {
        assert_eq!(sanitize("1 < 2 > 0"), "1 &lt; 2 &gt; 0");
        assert_eq!(sanitize("a <b"), "a &lt;b");
        assert_eq!(sanitize("fish & chips &amp; peas"), "fish &amp; chips &amp; peas");
    }

    #[test]
    fn test_plain_text_passes_through() {
        assert_eq!(sanitize("Hello @B"), "Hello @B");
        assert_eq!(sanitize("こんにちは"), "こんにちは");
    }

    #[test]
    fn test_unterminated_script_swallows_rest() {
        assert_eq!(sanitize("ok <script>alert(1)"), "ok ");
    }

    #[test]
    fn test_plain_text_strips_allowed_tags() {
        assert_eq!(plain_text("<b>hi</b><br>"), "hi");
        assert_eq!(plain_text(&sanitize("<br>")).trim(), "");
    }

    #[test]
    fn test_nested_tag_names_leave_no_markup() {
        let out = sanitize("<scr<script>ipt>alert(1)</script>");
        assert_eq!(out, "ipt&gt;alert(1)");
        assert_eq!(sanitize("<<script>script>alert(1)"), "&lt;");
        assert_eq!(sanitize("<scr<b>ipt>"), "ipt&gt;");
    }

    #[test]
    fn test_event_handler_attributes_dropped() {
        assert_eq!(sanitize("<img src=x onerror=alert(1)>hi"), "hi");
        assert_eq!(sanitize("<img src=\"x>\" onerror=\"alert(1)\">hi"), "hi");
        assert_eq!(sanitize("<b onmouseover='alert(1)'>x</b>"), "<b>x</b>");
        assert_eq!(sanitize("<svg/onload=alert(1)>x"), "x");
    }

    #[test]
    fn test_unclosed_tags_become_text() {
        assert_eq!(sanitize("<b"), "&lt;b");
        assert_eq!(sanitize("<b onclick=alert(1)"), "&lt;b onclick=alert(1)");
        assert_eq!(sanitize("<b title=\"x>y"), "&lt;b title=\"x&gt;y");
    }

    #[test]
    fn test_javascript_urls_removed_with_attributes() {
        assert_eq!(sanitize("<a href=\"javascript:alert(1)\">x</a>"), "x");
        assert_eq!(
            sanitize("<b style=\"background:url(javascript:alert(1))\">x</b>"),
            "<b>x</b>"
        );
        // Bare text is harmless once no tag can carry it.
        assert_eq!(sanitize("javascript:alert(1)"), "javascript:alert(1)");
    }

    #[test]
    fn test_encoded_markup_stays_encoded() {
        let input = "&#x3c;script&#x3e;alert(1)&#x3c;/script&#x3e;";
        let out = sanitize(input);
        assert_eq!(out, input);
        assert!(!out.contains('<'));
        assert_eq!(plain_text(&out), "<script>alert(1)</script>");
        assert_eq!(sanitize("&lt;b&gt;"), "&lt;b&gt;");
    }

    #[test]
    fn test_plain_text_decodes_entities() {
        assert_eq!(plain_text("sp&#97;m"), "spam");
        assert_eq!(plain_text("sp&#x61;m &amp; eggs"), "spam & eggs");
        assert_eq!(plain_text("&amp;#97;"), "&#97;");
        assert_eq!(plain_text(&sanitize("fish & chips")), "fish & chips");
    }

    #[tokio::test]
    async fn test_keyword_moderator() {
        let moderator = KeywordModerator::default();
        assert_eq!(moderator.evaluate("hello there").await, Verdict::Allowed);

        let verdict = moderator.evaluate("Buy SPAM now").await;
        assert_eq!(
            verdict,
            Verdict::Blocked(Some("Contains inappropriate content: spam".into()))
        );
    }

    #[tokio::test]
    async fn test_keyword_hidden_behind_entities_blocked() {
        let moderator = KeywordModerator::default();
        let plain = plain_text(&sanitize("buy <b>sp&#97;m</b> now"));
        assert!(moderator.evaluate(&plain).await.is_blocked());
    }

    #[tokio::test]
    async fn test_custom_keywords() {
        let moderator = KeywordModerator::new(["  Foo ", ""]);
        assert_eq!(moderator.keywords().collect::<Vec<_>>(), vec!["foo"]);
        assert!(moderator.evaluate("food").await.is_blocked());
    }
}
