//! Org-mode markup parsing library: classifies physical lines, tokenizes
//! inline markup, and assembles an immutable section tree. The parser is
//! total: malformed input degrades to plain content, it never errors.

pub mod core {
    use chrono::{NaiveDate, NaiveTime};
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};
    use std::collections::BTreeSet;
    use uuid::Uuid;

    /* ------------------------------- IDs ------------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct DocumentId(pub Uuid);

    impl DocumentId {
        pub fn new() -> Self {
            Self(Uuid::new_v4())
        }
    }

    impl Default for DocumentId {
        fn default() -> Self {
            Self::new()
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct SectionId(pub Uuid);

    impl SectionId {
        pub fn new() -> Self {
            Self(Uuid::new_v4())
        }
    }

    impl Default for SectionId {
        fn default() -> Self {
            Self::new()
        }
    }

    /* ------------------------------ Aggregate ------------------------------ */

    /// Aggregate root: one parsed document. Created by a single parse pass
    /// and never mutated afterwards; re-parsing produces a fresh tree.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Document {
        pub id: DocumentId,

        /// Content appearing before the first heading.
        #[serde(default)]
        pub preamble: Preamble,

        /// Top-level sections in document order.
        #[serde(default)]
        pub sections: Vec<Section>,
    }

    impl Document {
        pub fn new() -> Self {
            Self {
                id: DocumentId::new(),
                preamble: Preamble::default(),
                sections: vec![],
            }
        }
    }

    impl Default for Document {
        fn default() -> Self {
            Self::new()
        }
    }

    /// Un-headed leading content: directives, a document-level property
    /// drawer, and any body blocks before the first heading.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct Preamble {
        #[serde(default)]
        pub directives: Vec<Directive>,
        #[serde(default)]
        pub properties: IndexMap<String, String>,
        #[serde(default)]
        pub body: Vec<Block>,
    }

    /* ------------------------------ Entities ------------------------------ */

    /// One heading and everything nested beneath it until a heading of
    /// equal-or-lower level. Children are exclusively owned; there are no
    /// back references, so cycles are impossible by construction.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Section {
        pub id: SectionId,

        /// 1 = top level. Every descendant has a strictly greater level.
        pub level: u8,

        /// Optional state keyword from the configured vocabulary.
        pub todo: Option<TodoKeyword>,

        /// Optional priority cookie like `[#A]`.
        pub priority: Option<Priority>,

        /// Title as inline markup spans.
        pub title: RichText,

        /// Trailing `:tag1:tag2:` block.
        #[serde(default)]
        pub tags: BTreeSet<Tag>,

        /// SCHEDULED / DEADLINE / CLOSED cookies.
        #[serde(default)]
        pub planning: Planning,

        /// Property drawer contents, in drawer order.
        #[serde(default)]
        pub properties: IndexMap<String, String>,

        /// `#+KEY: VALUE` lines in this section's body, in encounter order.
        #[serde(default)]
        pub directives: Vec<Directive>,

        /// Paragraphs and opaque raw blocks under this heading.
        #[serde(default)]
        pub body: Vec<Block>,

        #[serde(default)]
        pub children: Vec<Section>,
    }

    impl Section {
        pub fn new(level: u8, title: RichText) -> Self {
            Self {
                id: SectionId::new(),
                level,
                todo: None,
                priority: None,
                title,
                tags: BTreeSet::new(),
                planning: Planning::default(),
                properties: IndexMap::new(),
                directives: vec![],
                body: vec![],
                children: vec![],
            }
        }
    }

    /* ---------------------------- Value Objects ---------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    pub struct Tag(pub String);

    impl From<&str> for Tag {
        fn from(s: &str) -> Self {
            Self(s.to_string())
        }
    }

    /// Single-character priority cookie, e.g. the `A` of `[#A]`. Urgency
    /// ordering is positional in `ParseConfig::priorities`, not alphabetic.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    pub struct Priority(pub char);

    /// State keyword with a "done" flag so callers can respect custom
    /// vocabularies without re-consulting the configuration.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TodoKeyword {
        pub text: String,
        pub is_done: bool,
    }

    /// `#+KEY: VALUE` metadata, stored opaquely. Interpretation of known
    /// keys lives in `query::meta`, never in the parser.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Directive {
        pub key: String,
        pub value: String,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct Planning {
        pub scheduled: Option<Timestamp>,
        pub deadline: Option<Timestamp>,
        pub closed: Option<Timestamp>,
    }

    /// Calendar-naive timestamp: `<2024-05-01 Wed 10:00 +1w>` or the
    /// inactive `[...]` variant. No timezone handling.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Timestamp {
        /// `<...>` timestamps are active, `[...]` inactive.
        pub active: bool,
        pub date: NaiveDate,
        pub time: Option<NaiveTime>,
        pub repeater: Option<Repeater>,
    }

    /// Repeat cookie such as `+1w`, `++2d`, `.+1m`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Repeater {
        pub kind: RepeaterKind,
        pub amount: u32,
        pub unit: RepeatUnit,
    }

    /// `+` (from last completion), `++` (from base date), `.+` (from now).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum RepeaterKind {
        FromLast,
        FromBase,
        FromNow,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum RepeatUnit {
        Hour,
        Day,
        Week,
        Month,
        Year,
    }

    /* ---------------------------- Content Model ---------------------------- */

    /// Body-level elements. `Raw` holds constructs the parser keeps opaque
    /// (tables, lists, `#+BEGIN_…` blocks); dedicated sub-parsers can turn
    /// these into typed variants later without touching the tree builder.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub enum Block {
        Paragraph(RichText),
        Raw { kind: RawKind, text: String },
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum RawKind {
        Table,
        List,
        Literal,
    }

    /// An inline-markup run used for titles and paragraphs.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct RichText {
        #[serde(default)]
        pub inlines: Vec<Inline>,
    }

    /// Closed sum of inline span kinds. Emphasis children nest up to
    /// `MarkupConfig::max_depth`; code and verbatim content is literal.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub enum Inline {
        Text(String),
        Emphasis {
            kind: Emphasis,
            children: Vec<Inline>,
        },
        Code(String),
        Verbatim(String),
        Link {
            target: String,
            desc: Option<Vec<Inline>>,
        },
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum Emphasis {
        Bold,
        Italic,
        Underline,
        Strike,
    }

    impl RichText {
        /// Plain-text approximation, useful for display paths and task lists.
        pub fn plain_text(&self) -> String {
            fn rec(xs: &[Inline], out: &mut String) {
                for x in xs {
                    match x {
                        Inline::Text(t) => out.push_str(t),
                        Inline::Emphasis { children, .. } => rec(children, out),
                        Inline::Code(t) | Inline::Verbatim(t) => out.push_str(t),
                        Inline::Link { desc: Some(d), .. } => rec(d, out),
                        Inline::Link { target, desc: None } => out.push_str(target),
                    }
                }
            }
            let mut s = String::new();
            rec(&self.inlines, &mut s);
            s
        }
    }

    /* ----------------------------- Configuration ----------------------------- */

    /// Parse-time configuration. Everything has org-flavoured defaults; the
    /// parser itself hardcodes none of these surfaces.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ParseConfig {
        /// Recognized state keywords, split into not-done and done sets.
        #[serde(default)]
        pub todo: TodoVocabulary,

        /// Recognized priority cookie characters, most urgent first.
        #[serde(default = "ParseConfig::default_priorities")]
        pub priorities: Vec<char>,

        #[serde(default)]
        pub markup: MarkupConfig,
    }

    impl Default for ParseConfig {
        fn default() -> Self {
            Self {
                todo: TodoVocabulary::default(),
                priorities: Self::default_priorities(),
                markup: MarkupConfig::default(),
            }
        }
    }

    impl ParseConfig {
        fn default_priorities() -> Vec<char> {
            vec!['A', 'B', 'C']
        }

        /// Look a word up in the vocabulary; `None` when unrecognized.
        pub fn todo_keyword(&self, word: &str) -> Option<TodoKeyword> {
            if word.is_empty() {
                return None;
            }
            if self.todo.active.iter().any(|k| k == word) {
                return Some(TodoKeyword {
                    text: word.to_string(),
                    is_done: false,
                });
            }
            if self.todo.done.iter().any(|k| k == word) {
                return Some(TodoKeyword {
                    text: word.to_string(),
                    is_done: true,
                });
            }
            None
        }

        /// Position of a cookie in the configured ordering; 0 is most urgent.
        pub fn priority_rank(&self, priority: Priority) -> Option<usize> {
            self.priorities.iter().position(|c| *c == priority.0)
        }

        pub fn validate(&self) -> Result<(), DomainError> {
            if self
                .todo
                .active
                .iter()
                .chain(self.todo.done.iter())
                .any(|k| k.is_empty())
            {
                return Err(DomainError::EmptyTodoKeyword);
            }
            let markers = [
                self.markup.bold,
                self.markup.italic,
                self.markup.underline,
                self.markup.strike,
                self.markup.code,
                self.markup.verbatim,
                self.markup.escape,
            ];
            for (i, c) in markers.iter().enumerate() {
                if markers[i + 1..].contains(c) {
                    return Err(DomainError::DuplicateMarker(*c));
                }
            }
            Ok(())
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TodoVocabulary {
        #[serde(default)]
        pub active: Vec<String>,
        #[serde(default)]
        pub done: Vec<String>,
    }

    impl Default for TodoVocabulary {
        fn default() -> Self {
            Self {
                active: vec!["TODO".to_string()],
                done: vec!["DONE".to_string()],
            }
        }
    }

    /// Marker characters for the inline tokenizer plus the nesting bound
    /// that guarantees termination on pathological input.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct MarkupConfig {
        pub bold: char,
        pub italic: char,
        pub underline: char,
        pub strike: char,
        pub code: char,
        pub verbatim: char,
        pub escape: char,
        pub max_depth: usize,
    }

    impl Default for MarkupConfig {
        fn default() -> Self {
            Self {
                bold: '*',
                italic: '/',
                underline: '_',
                strike: '+',
                code: '~',
                verbatim: '=',
                escape: '\\',
                max_depth: 20,
            }
        }
    }

    impl MarkupConfig {
        pub fn emphasis_for(&self, c: char) -> Option<Emphasis> {
            if c == self.bold {
                Some(Emphasis::Bold)
            } else if c == self.italic {
                Some(Emphasis::Italic)
            } else if c == self.underline {
                Some(Emphasis::Underline)
            } else if c == self.strike {
                Some(Emphasis::Strike)
            } else {
                None
            }
        }

        pub fn is_marker(&self, c: char) -> bool {
            self.emphasis_for(c).is_some() || c == self.code || c == self.verbatim
        }
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, thiserror::Error)]
    pub enum DomainError {
        #[error("section level {0} is out of bounds (must be >= 1)")]
        InvalidLevel(u8),
        #[error("todo vocabulary contains an empty keyword")]
        EmptyTodoKeyword,
        #[error("markup marker {0:?} is configured more than once")]
        DuplicateMarker(char),
    }
}

pub mod classify {
    //! Line classifier: splits normalized text into physical lines and tags
    //! each with a syntactic kind. Purely line-local: no lookahead, no tree
    //! state. Anything unrecognized is `Plain`; malformed structure is the
    //! tree builder's problem to degrade gracefully.

    use nom::{
        IResult,
        bytes::complete::{tag, take_while1},
        character::complete::{char, space0},
        combinator::{all_consuming, map, rest},
        sequence::{delimited, terminated, tuple},
    };

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct ClassifiedLine<'a> {
        pub text: &'a str,
        /// 1-based physical line number.
        pub number: usize,
        pub kind: LineKind<'a>,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum LineKind<'a> {
        Heading { level: u8 },
        DrawerOpen { name: &'a str },
        DrawerEnd,
        Directive { key: &'a str, value: &'a str },
        Planning,
        Blank,
        Plain,
    }

    /// Classify every line of `text`. Expects `\n` line endings; the parser
    /// entry point normalizes `\r\n` before calling in here.
    pub fn classify(text: &str) -> Vec<ClassifiedLine<'_>> {
        text.split('\n')
            .enumerate()
            .map(|(idx, line)| ClassifiedLine {
                text: line,
                number: idx + 1,
                kind: classify_line(line),
            })
            .collect()
    }

    pub fn classify_line(line: &str) -> LineKind<'_> {
        if line.trim().is_empty() {
            return LineKind::Blank;
        }
        if let Some(level) = heading_level(line) {
            return LineKind::Heading { level };
        }
        if let Ok((_, name)) = drawer_boundary(line) {
            return if name.eq_ignore_ascii_case("END") {
                LineKind::DrawerEnd
            } else {
                LineKind::DrawerOpen { name }
            };
        }
        if let Ok((_, (key, value))) = directive_line(line) {
            return LineKind::Directive { key, value };
        }
        if is_planning_line(line) {
            return LineKind::Planning;
        }
        LineKind::Plain
    }

    /// A line is a heading iff it starts with a run of `*` followed by a
    /// space or tab. `*bold*` at column zero is plain text, not a heading.
    pub fn heading_level(line: &str) -> Option<u8> {
        let stars = line.bytes().take_while(|b| *b == b'*').count();
        if stars == 0 {
            return None;
        }
        match line.as_bytes().get(stars) {
            Some(b' ' | b'\t') => Some(stars.min(u8::MAX as usize) as u8),
            _ => None,
        }
    }

    fn is_planning_line(line: &str) -> bool {
        let t = line.trim_start();
        t.starts_with("SCHEDULED:") || t.starts_with("DEADLINE:") || t.starts_with("CLOSED:")
    }

    fn is_drawer_name_char(c: char) -> bool {
        c.is_ascii_alphanumeric() || c == '_' || c == '-'
    }

    /// `:NAME:` with nothing but whitespace around it.
    fn drawer_boundary(i: &str) -> IResult<&str, &str> {
        all_consuming(delimited(
            space0,
            delimited(char(':'), take_while1(is_drawer_name_char), char(':')),
            space0,
        ))(i)
    }

    /// `#+KEY: VALUE` anchored at column zero.
    fn directive_line(i: &str) -> IResult<&str, (&str, &str)> {
        map(
            tuple((
                tag("#+"),
                take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_'),
                terminated(char(':'), space0),
                rest,
            )),
            |(_, key, _, value): (_, &str, _, &str)| (key, value.trim_end()),
        )(i)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn headings_require_trailing_whitespace() {
            assert_eq!(classify_line("* Title"), LineKind::Heading { level: 1 });
            assert_eq!(classify_line("*** Deep"), LineKind::Heading { level: 3 });
            assert_eq!(classify_line("*bold* text"), LineKind::Plain);
            assert_eq!(classify_line("*"), LineKind::Plain);
        }

        #[test]
        fn drawer_boundaries() {
            assert_eq!(
                classify_line(":PROPERTIES:"),
                LineKind::DrawerOpen { name: "PROPERTIES" }
            );
            assert_eq!(
                classify_line("  :LOGBOOK:  "),
                LineKind::DrawerOpen { name: "LOGBOOK" }
            );
            assert_eq!(classify_line(":END:"), LineKind::DrawerEnd);
            assert_eq!(classify_line(":end:"), LineKind::DrawerEnd);
            // interior property lines carry a value, so they are not boundaries
            assert_eq!(classify_line(":CUSTOM_ID: abc"), LineKind::Plain);
        }

        #[test]
        fn directives_and_planning() {
            assert_eq!(
                classify_line("#+TITLE: My Doc"),
                LineKind::Directive {
                    key: "TITLE",
                    value: "My Doc"
                }
            );
            assert_eq!(classify_line("#+TITLE no colon"), LineKind::Plain);
            assert_eq!(classify_line("SCHEDULED: <2024-05-01>"), LineKind::Planning);
            assert_eq!(classify_line("  DEADLINE: <2024-05-01>"), LineKind::Planning);
        }

        #[test]
        fn blank_and_plain() {
            assert_eq!(classify_line(""), LineKind::Blank);
            assert_eq!(classify_line("   "), LineKind::Blank);
            assert_eq!(classify_line("just prose"), LineKind::Plain);
        }

        #[test]
        fn line_numbers_are_one_based() {
            let lines = classify("a\n\nb");
            assert_eq!(lines.len(), 3);
            assert_eq!(lines[0].number, 1);
            assert_eq!(lines[2].number, 3);
            assert_eq!(lines[2].kind, LineKind::Plain);
        }
    }
}

pub mod markup {
    //! Inline markup tokenizer: one left-to-right scan with a marker stack.
    //! Markers open only against a whitespace/punctuation boundary and close
    //! only against the inverse boundary; anything unmatched stays literal.
    //! Code and verbatim spans are scanned to their closing marker without
    //! recursing. Nesting is bounded by `MarkupConfig::max_depth`.

    use crate::core::{Emphasis, Inline, MarkupConfig};

    /// Tokenize a title or joined paragraph into inline spans.
    pub fn tokenize(text: &str, cfg: &MarkupConfig) -> Vec<Inline> {
        scan(text, cfg, 0)
    }

    struct Frame {
        marker: char,
        kind: Emphasis,
        /// Index into `out` where this span's children begin.
        start: usize,
    }

    fn scan(text: &str, cfg: &MarkupConfig, depth: usize) -> Vec<Inline> {
        if text.is_empty() {
            return vec![];
        }
        if depth >= cfg.max_depth {
            return vec![Inline::Text(text.to_string())];
        }

        let chars: Vec<char> = text.chars().collect();
        let len = chars.len();
        let mut out: Vec<Inline> = Vec::new();
        let mut frames: Vec<Frame> = Vec::new();
        let mut plain = String::new();
        let mut i = 0;

        while i < len {
            let c = chars[i];
            let prev = if i == 0 { None } else { Some(chars[i - 1]) };

            // Escape suppresses the next character's special meaning.
            if c == cfg.escape && i + 1 < len {
                let next = chars[i + 1];
                if cfg.is_marker(next) || next == '[' || next == ']' || next == cfg.escape {
                    plain.push(next);
                    i += 2;
                    continue;
                }
            }

            // Bracketed links have their own balanced grammar.
            if c == '[' && i + 1 < len && chars[i + 1] == '[' {
                if let Some((link, consumed)) = scan_link(&chars[i..], cfg, depth) {
                    flush(&mut plain, &mut out);
                    out.push(link);
                    i += consumed;
                    continue;
                }
            }

            // Code and verbatim spans: literal content, no nested markup.
            if (c == cfg.code || c == cfg.verbatim) && open_boundary(prev, chars.get(i + 1)) {
                if let Some(end) = find_code_close(&chars, i, c, cfg.escape) {
                    flush(&mut plain, &mut out);
                    let body: String = chars[i + 1..end].iter().collect();
                    out.push(if c == cfg.code {
                        Inline::Code(body)
                    } else {
                        Inline::Verbatim(body)
                    });
                    i = end + 1;
                    continue;
                }
            }

            if let Some(kind) = cfg.emphasis_for(c) {
                // Close the most recently opened span of this marker.
                if close_boundary(prev, chars.get(i + 1)) {
                    if let Some(pos) = frames.iter().rposition(|f| f.marker == c) {
                        let empty = pos + 1 == frames.len()
                            && frames[pos].start == out.len()
                            && plain.is_empty();
                        if !empty {
                            flush(&mut plain, &mut out);
                            // Opens above the matched frame never closed:
                            // re-emit their markers as literal text.
                            while frames.len() > pos + 1 {
                                let dangling = frames.pop().unwrap();
                                out.insert(
                                    dangling.start,
                                    Inline::Text(dangling.marker.to_string()),
                                );
                            }
                            let frame = frames.pop().unwrap();
                            let mut children = out.split_off(frame.start);
                            coalesce(&mut children);
                            out.push(Inline::Emphasis {
                                kind: frame.kind,
                                children,
                            });
                            i += 1;
                            continue;
                        }
                    }
                }
                // Open a new span, unless the nesting cap says plain text.
                if open_boundary(prev, chars.get(i + 1)) && depth + frames.len() < cfg.max_depth {
                    flush(&mut plain, &mut out);
                    frames.push(Frame {
                        marker: c,
                        kind,
                        start: out.len(),
                    });
                    i += 1;
                    continue;
                }
            }

            plain.push(c);
            i += 1;
        }

        flush(&mut plain, &mut out);
        // Unmatched opens become literal marker characters, top-down so the
        // recorded split points stay valid.
        while let Some(frame) = frames.pop() {
            out.insert(frame.start, Inline::Text(frame.marker.to_string()));
        }
        coalesce(&mut out);
        out
    }

    /// A marker may open after start-of-input, whitespace, or punctuation,
    /// and only when something non-whitespace follows.
    fn open_boundary(prev: Option<char>, next: Option<&char>) -> bool {
        let pre_ok = prev.map_or(true, |p| p.is_whitespace() || p.is_ascii_punctuation());
        let post_ok = next.map_or(false, |n| !n.is_whitespace());
        pre_ok && post_ok
    }

    /// The inverse: non-whitespace before, boundary after.
    fn close_boundary(prev: Option<char>, next: Option<&char>) -> bool {
        let pre_ok = prev.map_or(false, |p| !p.is_whitespace());
        let post_ok = next.map_or(true, |n| n.is_whitespace() || n.is_ascii_punctuation());
        pre_ok && post_ok
    }

    fn find_code_close(chars: &[char], open: usize, marker: char, escape: char) -> Option<usize> {
        let mut j = open + 2;
        while j < chars.len() {
            if chars[j] == marker && chars[j - 1] != escape {
                return Some(j);
            }
            j += 1;
        }
        None
    }

    /// `[[target]]` or `[[target][description]]`. Returns the span and the
    /// number of chars consumed; `None` leaves the brackets to plain text.
    fn scan_link(chars: &[char], cfg: &MarkupConfig, depth: usize) -> Option<(Inline, usize)> {
        let len = chars.len();
        let mut sep = None;
        let mut end = None;
        let mut j = 2;
        while j + 1 < len {
            if chars[j] == ']' && chars[j + 1] == ']' {
                end = Some(j);
                break;
            }
            if sep.is_none() && chars[j] == ']' && chars[j + 1] == '[' {
                sep = Some(j);
                j += 2;
                continue;
            }
            j += 1;
        }
        let end = end?;
        let (target_end, desc) = match sep {
            Some(s) => {
                let desc_text: String = chars[s + 2..end].iter().collect();
                (s, Some(scan(&desc_text, cfg, depth + 1)))
            }
            None => (end, None),
        };
        let target: String = chars[2..target_end].iter().collect();
        if target.is_empty() {
            return None;
        }
        Some((Inline::Link { target, desc }, end + 2))
    }

    fn flush(plain: &mut String, out: &mut Vec<Inline>) {
        if !plain.is_empty() {
            out.push(Inline::Text(std::mem::take(plain)));
        }
    }

    fn coalesce(xs: &mut Vec<Inline>) {
        let mut merged = Vec::with_capacity(xs.len());
        for x in xs.drain(..) {
            if let (Some(Inline::Text(prev)), Inline::Text(s)) = (merged.last_mut(), &x) {
                prev.push_str(s);
            } else {
                merged.push(x);
            }
        }
        *xs = merged;
    }

}

pub mod parser {
    //! The parsing engine: heading metadata extraction, planning/drawer/
    //! directive sub-parsers, and the stack-driven tree builder.
    //!
    //! Parsing strategy:
    //! - The classifier tags each physical line; the builder walks the tags
    //!   once with an explicit stack of open sections (monotonic level pops,
    //!   no backtracking across headings).
    //! - Headline fields and timestamps are parsed with `nom` combinators.
    //! - Every malformed-input path falls back to the most literal reading
    //!   (plain text or an empty field); `parse` is total.

    use crate::classify::{self, ClassifiedLine, LineKind};
    use crate::core::*;
    use crate::markup;
    use indexmap::IndexMap;
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{tag, take_while1, take_while_m_n},
        character::complete::{char, digit1, space0, space1},
        combinator::{map, map_res, opt},
        sequence::{delimited, preceded, tuple},
    };
    use std::collections::BTreeSet;

    /// Synthetic property key for drawer lines that precede any `:KEY:` pair.
    const DRAWER_CONTINUATION_KEY: &str = "_CONTENT";

    /* ------------------------ Public entry points ------------------------ */

    /// Parse a document with the default configuration. Total: returns a
    /// tree for any input, never an error.
    pub fn parse(text: &str) -> Document {
        parse_with_config(text, &ParseConfig::default())
    }

    pub fn parse_with_config(text: &str, config: &ParseConfig) -> Document {
        let normalized = text.replace("\r\n", "\n");
        let lines = classify::classify(&normalized);
        TreeBuilder::new(config).build(&lines)
    }

    /* --------------------------- Headline fields --------------------------- */

    /// Extract level, state keyword, priority, tags, and title spans from a
    /// heading line. Stages are positional; a non-matching stage leaves its
    /// field empty and hands the text to the next stage.
    pub(crate) fn extract_heading(line: &str, config: &ParseConfig) -> Section {
        let stars = line.bytes().take_while(|b| *b == b'*').count();
        let level = stars.min(u8::MAX as usize) as u8;
        let rest = line[stars..].trim();

        let (rest, tags) = split_trailing_tags(rest);
        let (todo, rest) = split_todo(rest, config);
        let (priority, rest) = split_priority(rest, config);

        let mut section = Section::new(
            level,
            RichText {
                inlines: markup::tokenize(rest, &config.markup),
            },
        );
        section.todo = todo;
        section.priority = priority;
        section.tags = tags;
        section
    }

    fn is_tag_char(c: char) -> bool {
        c.is_alphanumeric() || c == '_' || c == '-' || c == '@' || c == '+'
    }

    /// The trailing tag block counts only when the entire end-of-line suffix
    /// matches `:tag:tag:`; colons inside ordinary title text never do.
    pub(crate) fn split_trailing_tags(title: &str) -> (&str, BTreeSet<Tag>) {
        let trimmed = title.trim_end();
        if !trimmed.ends_with(':') {
            return (title, BTreeSet::new());
        }
        let (head, suffix) = match trimmed.rfind(char::is_whitespace) {
            Some(pos) => (&trimmed[..pos], trimmed[pos..].trim_start()),
            None => ("", trimmed),
        };
        if !suffix.starts_with(':') || suffix.len() < 3 {
            return (title, BTreeSet::new());
        }
        let interior = &suffix[1..suffix.len() - 1];
        let parts: Vec<&str> = interior.split(':').collect();
        if parts
            .iter()
            .any(|p| p.is_empty() || !p.chars().all(is_tag_char))
        {
            return (title, BTreeSet::new());
        }
        let tags = parts.into_iter().map(Tag::from).collect();
        (head.trim_end(), tags)
    }

    fn split_todo<'a>(text: &'a str, config: &ParseConfig) -> (Option<TodoKeyword>, &'a str) {
        let word = text.split_whitespace().next().unwrap_or("");
        match config.todo_keyword(word) {
            Some(keyword) => (Some(keyword), text[word.len()..].trim_start()),
            None => (None, text),
        }
    }

    fn split_priority<'a>(text: &'a str, config: &ParseConfig) -> (Option<Priority>, &'a str) {
        let Some(rest) = text.strip_prefix("[#") else {
            return (None, text);
        };
        let mut chars = rest.chars();
        let Some(cookie) = chars.next() else {
            return (None, text);
        };
        if !config.priorities.contains(&cookie) {
            return (None, text);
        }
        let Some(after) = chars.as_str().strip_prefix(']') else {
            return (None, text);
        };
        (Some(Priority(cookie)), after.trim_start())
    }

    /* ----------------------------- Timestamps ----------------------------- */

    fn ascii_digit(c: char) -> bool {
        c.is_ascii_digit()
    }

    fn parse_date(i: &str) -> IResult<&str, chrono::NaiveDate> {
        map_res(
            tuple((
                map_res(take_while_m_n(4, 4, ascii_digit), str::parse::<i32>),
                char('-'),
                map_res(take_while_m_n(2, 2, ascii_digit), str::parse::<u32>),
                char('-'),
                map_res(take_while_m_n(2, 2, ascii_digit), str::parse::<u32>),
            )),
            |(y, _, m, _, d)| chrono::NaiveDate::from_ymd_opt(y, m, d).ok_or("invalid date"),
        )(i)
    }

    fn parse_time(i: &str) -> IResult<&str, chrono::NaiveTime> {
        map_res(
            tuple((
                map_res(take_while_m_n(1, 2, ascii_digit), str::parse::<u32>),
                char(':'),
                map_res(take_while_m_n(2, 2, ascii_digit), str::parse::<u32>),
            )),
            |(h, _, m)| chrono::NaiveTime::from_hms_opt(h, m, 0).ok_or("invalid time"),
        )(i)
    }

    fn parse_repeater(i: &str) -> IResult<&str, Repeater> {
        let (i, kind) = alt((
            map(tag(".+"), |_| RepeaterKind::FromNow),
            map(tag("++"), |_| RepeaterKind::FromBase),
            map(tag("+"), |_| RepeaterKind::FromLast),
        ))(i)?;
        let (i, amount) = map_res(digit1, str::parse::<u32>)(i)?;
        let (i, unit) = alt((
            map(char('h'), |_| RepeatUnit::Hour),
            map(char('d'), |_| RepeatUnit::Day),
            map(char('w'), |_| RepeatUnit::Week),
            map(char('m'), |_| RepeatUnit::Month),
            map(char('y'), |_| RepeatUnit::Year),
        ))(i)?;
        Ok((i, Repeater { kind, amount, unit }))
    }

    fn day_name(i: &str) -> IResult<&str, &str> {
        take_while1(|c: char| c.is_alphabetic())(i)
    }

    /// `<YYYY-MM-DD [DOW] [HH:MM] [+Nu]>` or the inactive `[...]` form.
    pub(crate) fn parse_timestamp(i: &str) -> IResult<&str, Timestamp> {
        let active = i.starts_with('<');
        let (i, _) = alt((char('<'), char('[')))(i)?;
        let (i, date) = parse_date(i)?;
        let (i, _dow) = opt(preceded(space1, day_name))(i)?;
        let (i, time) = opt(preceded(space1, parse_time))(i)?;
        let (i, repeater) = opt(preceded(space1, parse_repeater))(i)?;
        let (i, _) = space0(i)?;
        let (i, _) = alt((char('>'), char(']')))(i)?;
        Ok((
            i,
            Timestamp {
                active,
                date,
                time,
                repeater,
            },
        ))
    }

    /* ----------------------------- Planning ----------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum PlanningSlot {
        Scheduled,
        Deadline,
        Closed,
    }

    fn strip_cookie(text: &str) -> Option<(PlanningSlot, &str)> {
        for (cookie, slot) in [
            ("SCHEDULED:", PlanningSlot::Scheduled),
            ("DEADLINE:", PlanningSlot::Deadline),
            ("CLOSED:", PlanningSlot::Closed),
        ] {
            if let Some(rest) = text.strip_prefix(cookie) {
                return Some((slot, rest));
            }
        }
        None
    }

    /// Parse every cookie/timestamp pair on one planning line. A malformed
    /// timestamp leaves its field empty and abandons the rest of the line.
    pub(crate) fn parse_planning_line(line: &str) -> Planning {
        let mut planning = Planning::default();
        let mut rest = line.trim();
        while let Some((slot, after)) = strip_cookie(rest) {
            match parse_timestamp(after.trim_start()) {
                Ok((remaining, ts)) => {
                    match slot {
                        PlanningSlot::Scheduled => planning.scheduled = Some(ts),
                        PlanningSlot::Deadline => planning.deadline = Some(ts),
                        PlanningSlot::Closed => planning.closed = Some(ts),
                    }
                    rest = remaining.trim_start();
                }
                Err(_) => break,
            }
        }
        planning
    }

    /* ----------------------------- Drawer lines ----------------------------- */

    fn is_property_key_char(c: char) -> bool {
        c.is_ascii_alphanumeric() || c == '_' || c == '-'
    }

    /// `:KEY: value` (value may be empty). Fails on anything else so the
    /// caller can apply the continuation policy instead.
    pub(crate) fn parse_property_line(line: &str) -> Option<(&str, &str)> {
        let result: IResult<&str, &str> = preceded(
            space0,
            delimited(char(':'), take_while1(is_property_key_char), char(':')),
        )(line);
        let (rest, key) = result.ok()?;
        if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
            return None;
        }
        Some((key, rest.trim()))
    }

    /* ----------------------------- Raw blocks ----------------------------- */

    fn starts_with_ignore_ascii_case(s: &str, prefix: &str) -> bool {
        s.get(..prefix.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
    }

    fn is_list_bullet(line: &str) -> bool {
        let t = line.trim_start();
        if t.starts_with("- ") || t.starts_with("+ ") {
            return true;
        }
        // `* ` only counts indented; at column zero it is a heading
        if t.starts_with("* ") && line.starts_with(char::is_whitespace) {
            return true;
        }
        let digits = t.chars().take_while(|c| c.is_ascii_digit()).count();
        if digits == 0 {
            return false;
        }
        matches!(t[digits..].as_bytes(), [b'.', b' ', ..] | [b')', b' ', ..])
    }

    /// Opaque-block openers recognized by the builder. Their content is kept
    /// raw; dedicated sub-parsers can take over later.
    fn raw_block_start(line: &str) -> Option<RawKind> {
        let t = line.trim_start();
        if t.starts_with('|') {
            return Some(RawKind::Table);
        }
        if is_list_bullet(line) {
            return Some(RawKind::List);
        }
        if starts_with_ignore_ascii_case(t, "#+BEGIN_") {
            return Some(RawKind::Literal);
        }
        None
    }

    /* ----------------------------- Tree builder ----------------------------- */

    struct TreeBuilder<'a, 'c> {
        config: &'c ParseConfig,
        stack: Vec<Section>,
        roots: Vec<Section>,
        preamble: Preamble,
        para: Vec<&'a str>,
    }

    impl<'a, 'c> TreeBuilder<'a, 'c> {
        fn new(config: &'c ParseConfig) -> Self {
            Self {
                config,
                stack: vec![],
                roots: vec![],
                preamble: Preamble::default(),
                para: vec![],
            }
        }

        fn build(mut self, lines: &[ClassifiedLine<'a>]) -> Document {
            let mut idx = 0;
            // True directly after a heading, while planning lines and the
            // property drawer may still attach to it.
            let mut head_region = false;

            while idx < lines.len() {
                let line = &lines[idx];
                match line.kind {
                    LineKind::Heading { level } => {
                        self.flush_paragraph();
                        self.open_section(level, line.text);
                        head_region = true;
                        idx += 1;
                    }
                    LineKind::Planning if head_region => {
                        self.apply_planning(line.text);
                        idx += 1;
                    }
                    LineKind::DrawerOpen { .. } if head_region || self.stack.is_empty() => {
                        self.flush_paragraph();
                        idx = self.consume_drawer(lines, idx + 1);
                        head_region = false;
                    }
                    LineKind::Directive { key, value } => {
                        self.flush_paragraph();
                        self.push_directive(Directive {
                            key: key.to_string(),
                            value: value.to_string(),
                        });
                        head_region = false;
                        idx += 1;
                    }
                    LineKind::Blank => {
                        self.flush_paragraph();
                        head_region = false;
                        idx += 1;
                    }
                    LineKind::Plain => {
                        head_region = false;
                        if let Some(kind) = raw_block_start(line.text) {
                            self.flush_paragraph();
                            idx = self.consume_raw(lines, idx, kind);
                        } else {
                            self.para.push(line.text);
                            idx += 1;
                        }
                    }
                    // Stray :END:, out-of-place drawers, and planning lines
                    // detached from their heading all degrade to plain text.
                    LineKind::DrawerEnd | LineKind::DrawerOpen { .. } | LineKind::Planning => {
                        head_region = false;
                        self.para.push(line.text);
                        idx += 1;
                    }
                }
            }

            self.flush_paragraph();
            self.drain_stack();

            let mut document = Document::new();
            document.preamble = self.preamble;
            document.sections = self.roots;
            document
        }

        fn open_section(&mut self, level: u8, line: &str) {
            let node = extract_heading(line, self.config);
            while let Some(top) = self.stack.last() {
                if top.level < level {
                    break;
                }
                let completed = self.stack.pop().unwrap();
                if let Some(parent) = self.stack.last_mut() {
                    parent.children.push(completed);
                } else {
                    self.roots.push(completed);
                }
            }
            self.stack.push(node);
        }

        fn drain_stack(&mut self) {
            while let Some(completed) = self.stack.pop() {
                if let Some(parent) = self.stack.last_mut() {
                    parent.children.push(completed);
                } else {
                    self.roots.push(completed);
                }
            }
        }

        /// Consume drawer interior lines starting just past the opener.
        /// Returns the index of the first unconsumed line. A heading or end
        /// of input before `:END:` recovers with everything collected so far.
        fn consume_drawer(&mut self, lines: &[ClassifiedLine<'a>], start: usize) -> usize {
            let mut props: IndexMap<String, String> = IndexMap::new();
            let mut last_key: Option<String> = None;
            let mut idx = start;

            while idx < lines.len() {
                let line = &lines[idx];
                match line.kind {
                    LineKind::DrawerEnd => {
                        idx += 1;
                        break;
                    }
                    LineKind::Heading { .. } => break,
                    LineKind::Planning => {
                        self.apply_planning(line.text);
                        idx += 1;
                    }
                    LineKind::Blank => {
                        idx += 1;
                    }
                    _ => {
                        match parse_property_line(line.text) {
                            Some((key, value)) => {
                                props.insert(key.to_string(), value.to_string());
                                last_key = Some(key.to_string());
                            }
                            None => {
                                // Multi-line values concatenate onto the
                                // previous key; leading strays get a
                                // synthetic one.
                                let key = last_key
                                    .clone()
                                    .unwrap_or_else(|| DRAWER_CONTINUATION_KEY.to_string());
                                let entry = props.entry(key).or_default();
                                if !entry.is_empty() {
                                    entry.push('\n');
                                }
                                entry.push_str(line.text.trim());
                            }
                        }
                        idx += 1;
                    }
                }
            }

            let target = match self.stack.last_mut() {
                Some(top) => &mut top.properties,
                None => &mut self.preamble.properties,
            };
            target.extend(props);
            idx
        }

        fn consume_raw(
            &mut self,
            lines: &[ClassifiedLine<'a>],
            start: usize,
            kind: RawKind,
        ) -> usize {
            let mut collected: Vec<&str> = vec![lines[start].text];
            let mut idx = start + 1;

            match kind {
                RawKind::Table => {
                    while idx < lines.len() {
                        let line = &lines[idx];
                        if line.kind != LineKind::Plain || !line.text.trim_start().starts_with('|')
                        {
                            break;
                        }
                        collected.push(line.text);
                        idx += 1;
                    }
                }
                RawKind::List => {
                    while idx < lines.len() {
                        let line = &lines[idx];
                        let continuation = line.text.starts_with(char::is_whitespace)
                            && !line.text.trim().is_empty();
                        if line.kind != LineKind::Plain
                            || !(is_list_bullet(line.text) || continuation)
                        {
                            break;
                        }
                        collected.push(line.text);
                        idx += 1;
                    }
                }
                RawKind::Literal => {
                    // Everything until the #+END_ line (inclusive); a
                    // heading recovers an unterminated block.
                    while idx < lines.len() {
                        let line = &lines[idx];
                        if matches!(line.kind, LineKind::Heading { .. }) {
                            break;
                        }
                        collected.push(line.text);
                        idx += 1;
                        if starts_with_ignore_ascii_case(line.text.trim_start(), "#+END_") {
                            break;
                        }
                    }
                }
            }

            self.push_block(Block::Raw {
                kind,
                text: collected.join("\n"),
            });
            idx
        }

        fn flush_paragraph(&mut self) {
            if self.para.is_empty() {
                return;
            }
            let text = self.para.join("\n");
            self.para.clear();
            let inlines = markup::tokenize(&text, &self.config.markup);
            self.push_block(Block::Paragraph(RichText { inlines }));
        }

        fn push_block(&mut self, block: Block) {
            match self.stack.last_mut() {
                Some(top) => top.body.push(block),
                None => self.preamble.body.push(block),
            }
        }

        fn push_directive(&mut self, directive: Directive) {
            match self.stack.last_mut() {
                Some(top) => top.directives.push(directive),
                None => self.preamble.directives.push(directive),
            }
        }

        fn apply_planning(&mut self, line: &str) {
            let Some(top) = self.stack.last_mut() else {
                return;
            };
            let parsed = parse_planning_line(line);
            if parsed.scheduled.is_some() {
                top.planning.scheduled = parsed.scheduled;
            }
            if parsed.deadline.is_some() {
                top.planning.deadline = parsed.deadline;
            }
            if parsed.closed.is_some() {
                top.planning.closed = parsed.closed;
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use chrono::NaiveDate;
        use proptest::prelude::*;

        fn level_invariant(section: &Section) -> bool {
            section
                .children
                .iter()
                .all(|c| c.level > section.level && level_invariant(c))
        }

        #[test]
        fn heading_extracts_all_metadata() {
            let doc = parse("* Top\n** TODO [#A] Fix bug :urgent:work:\n");
            let child = &doc.sections[0].children[0];
            assert_eq!(child.level, 2);
            assert_eq!(child.todo.as_ref().map(|t| t.text.as_str()), Some("TODO"));
            assert_eq!(child.priority, Some(Priority('A')));
            assert_eq!(child.title.inlines, vec![Inline::Text("Fix bug".into())]);
            let mut tags: Vec<&str> = child.tags.iter().map(|t| t.0.as_str()).collect();
            tags.sort();
            assert_eq!(tags, vec!["urgent", "work"]);
        }

        #[test]
        fn metadata_extraction_is_idempotent_on_residual_title() {
            let config = ParseConfig::default();
            let section = extract_heading("** TODO [#A] Fix bug :urgent:work:", &config);
            let residual = section.title.plain_text();
            let again = extract_heading(&format!("** {residual}"), &config);
            assert!(again.todo.is_none());
            assert!(again.priority.is_none());
            assert!(again.tags.is_empty());
            assert_eq!(again.title.plain_text(), residual);
        }

        #[test]
        fn unrecognized_keyword_stays_in_title() {
            let doc = parse("* URGENT call the plumber\n");
            let section = &doc.sections[0];
            assert!(section.todo.is_none());
            assert_eq!(section.title.plain_text(), "URGENT call the plumber");
        }

        #[test]
        fn custom_todo_vocabulary() {
            let mut config = ParseConfig::default();
            config.todo.active.push("NEXT".to_string());
            config.todo.done.push("CANCELLED".to_string());
            let doc = parse_with_config("* NEXT thing\n* CANCELLED other\n", &config);
            assert_eq!(doc.sections[0].todo.as_ref().unwrap().text, "NEXT");
            assert!(!doc.sections[0].todo.as_ref().unwrap().is_done);
            assert!(doc.sections[1].todo.as_ref().unwrap().is_done);
        }

        #[test]
        fn done_keyword_is_flagged() {
            let doc = parse("* DONE shipped\n");
            assert!(doc.sections[0].todo.as_ref().unwrap().is_done);
        }

        #[test]
        fn priority_without_todo() {
            let doc = parse("* [#B] Chore\n");
            let section = &doc.sections[0];
            assert!(section.todo.is_none());
            assert_eq!(section.priority, Some(Priority('B')));
            assert_eq!(section.title.plain_text(), "Chore");
        }

        #[test]
        fn unknown_priority_cookie_stays_in_title() {
            let doc = parse("* [#Z] Chore\n");
            let section = &doc.sections[0];
            assert!(section.priority.is_none());
            assert_eq!(section.title.plain_text(), "[#Z] Chore");
        }

        #[test]
        fn colons_in_title_are_not_tags() {
            let doc = parse("* Use C++: the book\n* A :middle: tail\n");
            assert!(doc.sections[0].tags.is_empty());
            assert!(doc.sections[1].tags.is_empty());
            assert_eq!(doc.sections[1].title.plain_text(), "A :middle: tail");
        }

        #[test]
        fn whole_title_can_be_a_tag_block() {
            let (rest, tags) = split_trailing_tags(":a:b:");
            assert_eq!(rest, "");
            assert_eq!(tags.len(), 2);
        }

        #[test]
        fn deadline_sets_structured_date() {
            let doc = parse("* Pay rent\nDEADLINE: <2024-05-01 Wed>\n");
            let deadline = doc.sections[0].planning.deadline.as_ref().unwrap();
            assert_eq!(deadline.date, NaiveDate::from_ymd_opt(2024, 5, 1).unwrap());
            assert!(deadline.time.is_none());
            assert!(deadline.active);
        }

        #[test]
        fn scheduled_with_time_and_repeater() {
            let doc = parse("* Standup\nSCHEDULED: <2024-05-01 Wed 10:00 +1w>\n");
            let scheduled = doc.sections[0].planning.scheduled.as_ref().unwrap();
            assert_eq!(scheduled.time, chrono::NaiveTime::from_hms_opt(10, 0, 0));
            assert_eq!(
                scheduled.repeater,
                Some(Repeater {
                    kind: RepeaterKind::FromLast,
                    amount: 1,
                    unit: RepeatUnit::Week,
                })
            );
        }

        #[test]
        fn inactive_timestamp() {
            let doc = parse("* Log\nCLOSED: [2024-04-30]\n");
            let closed = doc.sections[0].planning.closed.as_ref().unwrap();
            assert!(!closed.active);
        }

        #[test]
        fn combined_planning_line() {
            let doc = parse("* Task\nSCHEDULED: <2024-05-01> DEADLINE: <2024-05-03>\n");
            let planning = &doc.sections[0].planning;
            assert!(planning.scheduled.is_some());
            assert!(planning.deadline.is_some());
        }

        #[test]
        fn malformed_timestamp_leaves_field_empty() {
            let doc = parse("* Task\nDEADLINE: <not-a-date>\nBody text\n");
            let section = &doc.sections[0];
            assert!(section.planning.deadline.is_none());
            assert_eq!(section.body.len(), 1);
        }

        #[test]
        fn planning_after_blank_line_is_body_text() {
            let doc = parse("* Task\n\nSCHEDULED: <2024-05-01>\n");
            let section = &doc.sections[0];
            assert!(section.planning.scheduled.is_none());
            assert_eq!(section.body.len(), 1);
        }

        #[test]
        fn drawer_becomes_properties() {
            let doc = parse("* Heading\n:PROPERTIES:\n:CUSTOM_ID: abc\n:END:\n");
            let section = &doc.sections[0];
            assert_eq!(
                section.properties.get("CUSTOM_ID").map(String::as_str),
                Some("abc")
            );
            assert!(section.body.is_empty());
        }

        #[test]
        fn drawer_after_planning_line() {
            let doc =
                parse("* Task\nSCHEDULED: <2024-05-01>\n:PROPERTIES:\n:ID: x1\n:END:\nBody\n");
            let section = &doc.sections[0];
            assert!(section.planning.scheduled.is_some());
            assert_eq!(section.properties.get("ID").map(String::as_str), Some("x1"));
            assert_eq!(section.body.len(), 1);
        }

        #[test]
        fn multiline_property_values_concatenate() {
            let doc = parse("* H\n:PROPERTIES:\n:NOTE: first\nsecond half\n:END:\n");
            let section = &doc.sections[0];
            assert_eq!(
                section.properties.get("NOTE").map(String::as_str),
                Some("first\nsecond half")
            );
        }

        #[test]
        fn unterminated_drawer_does_not_swallow_next_heading() {
            let doc = parse("* A\n:PROPERTIES:\n:X: 1\n* B\n");
            assert_eq!(doc.sections.len(), 2);
            assert_eq!(
                doc.sections[0].properties.get("X").map(String::as_str),
                Some("1")
            );
            assert_eq!(doc.sections[1].title.plain_text(), "B");
        }

        #[test]
        fn stray_end_is_plain_text() {
            let doc = parse("* H\nsome text\n:END:\n");
            let section = &doc.sections[0];
            assert_eq!(section.body.len(), 1);
            match &section.body[0] {
                Block::Paragraph(text) => {
                    assert!(text.plain_text().contains(":END:"));
                }
                other => panic!("expected paragraph, got {:?}", other),
            }
        }

        #[test]
        fn drawer_detached_from_heading_is_plain_text() {
            let doc = parse("* H\nprose first\n:PROPERTIES:\n:X: 1\n:END:\n");
            let section = &doc.sections[0];
            assert!(section.properties.is_empty());
            assert_eq!(section.body.len(), 1);
        }

        #[test]
        fn preamble_drawer_attaches_to_document() {
            let doc = parse(":SETUP:\n:AUTHOR: someone\n:END:\n* H\n");
            assert_eq!(
                doc.preamble.properties.get("AUTHOR").map(String::as_str),
                Some("someone")
            );
        }

        #[test]
        fn directives_attach_in_order() {
            let doc = parse("#+TITLE: Doc\n* H\n#+CAPTION: one\ntext\n#+NAME: two\n");
            assert_eq!(doc.preamble.directives.len(), 1);
            assert_eq!(doc.preamble.directives[0].key, "TITLE");
            let section = &doc.sections[0];
            assert_eq!(section.directives.len(), 2);
            assert_eq!(section.directives[0].key, "CAPTION");
            assert_eq!(section.directives[1].key, "NAME");
        }

        #[test]
        fn document_without_headings_is_all_preamble() {
            let doc = parse("just a paragraph\nsecond line\n\nanother\n");
            assert!(doc.sections.is_empty());
            assert_eq!(doc.preamble.body.len(), 2);
        }

        #[test]
        fn paragraph_lines_join_with_newline() {
            let doc = parse("* H\nline one\nline two\n");
            match &doc.sections[0].body[0] {
                Block::Paragraph(text) => {
                    assert_eq!(text.plain_text(), "line one\nline two");
                }
                other => panic!("expected paragraph, got {:?}", other),
            }
        }

        #[test]
        fn sibling_and_child_levels_nest_correctly() {
            let doc = parse("* A\n*** deep\n** shallower\n* B\n");
            assert_eq!(doc.sections.len(), 2);
            let a = &doc.sections[0];
            assert_eq!(a.children.len(), 2);
            assert_eq!(a.children[0].level, 3);
            assert_eq!(a.children[1].level, 2);
            assert!(doc.sections.iter().all(level_invariant));
        }

        #[test]
        fn level_jump_down_pops_to_root() {
            let doc = parse("** starts deep\n* then shallow\n");
            assert_eq!(doc.sections.len(), 2);
            assert_eq!(doc.sections[0].level, 2);
            assert_eq!(doc.sections[1].level, 1);
        }

        #[test]
        fn table_lines_become_one_raw_block() {
            let doc = parse("* H\n| a | b |\n| 1 | 2 |\nafter\n");
            let section = &doc.sections[0];
            assert_eq!(section.body.len(), 2);
            match &section.body[0] {
                Block::Raw { kind, text } => {
                    assert_eq!(*kind, RawKind::Table);
                    assert_eq!(text.lines().count(), 2);
                }
                other => panic!("expected raw table, got {:?}", other),
            }
        }

        #[test]
        fn list_run_becomes_one_raw_block() {
            let doc = parse("* H\n- one\n- two\n  continued\n\nprose\n");
            let section = &doc.sections[0];
            match &section.body[0] {
                Block::Raw { kind, text } => {
                    assert_eq!(*kind, RawKind::List);
                    assert_eq!(text.lines().count(), 3);
                }
                other => panic!("expected raw list, got {:?}", other),
            }
        }

        #[test]
        fn literal_block_kept_raw_until_end_marker() {
            let doc = parse("* H\n#+BEGIN_SRC rust\nfn main() {}\n#+END_SRC\nafter\n");
            let section = &doc.sections[0];
            match &section.body[0] {
                Block::Raw { kind, text } => {
                    assert_eq!(*kind, RawKind::Literal);
                    assert!(text.contains("fn main"));
                    assert!(text.ends_with("#+END_SRC"));
                }
                other => panic!("expected raw literal, got {:?}", other),
            }
        }

        #[test]
        fn unterminated_literal_block_stops_at_heading() {
            let doc = parse("* A\n#+BEGIN_EXAMPLE\nstuck\n* B\n");
            assert_eq!(doc.sections.len(), 2);
            assert!(matches!(
                doc.sections[0].body[0],
                Block::Raw {
                    kind: RawKind::Literal,
                    ..
                }
            ));
        }

        #[test]
        fn crlf_input_is_normalized() {
            let doc = parse("* A\r\n** B\r\n");
            assert_eq!(doc.sections[0].children[0].title.plain_text(), "B");
        }

        #[test]
        fn garbage_input_still_returns_a_tree() {
            let doc = parse("\u{0}\u{7f} *** \n:END:\n[#!] ~\n***nospace\n");
            assert!(doc.sections.iter().all(level_invariant));
        }

        proptest! {
            #[test]
            fn parse_is_total_and_hierarchy_holds(
                chars in proptest::collection::vec(proptest::char::any(), 0..200)
            ) {
                let input: String = chars.into_iter().collect();
                let doc = parse(&input);
                prop_assert!(doc.sections.iter().all(level_invariant));
            }
        }
    }
}

pub mod storage {
    //! Seam between the pure parser and the filesystem. Callers own all I/O;
    //! the parser only ever sees decoded text.

    use crate::core::{Document, DomainError, ParseConfig};
    use anyhow::{Context, Result};
    use std::fs;
    use std::path::Path;

    pub trait DocumentSource {
        fn load(&self, path: &Path) -> Result<Document>;
    }

    /// Reads a file and delegates to the tree parser.
    #[derive(Debug, Clone, Default)]
    pub struct TreeParser {
        config: ParseConfig,
    }

    impl TreeParser {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_config(config: ParseConfig) -> Result<Self, DomainError> {
            config.validate()?;
            Ok(Self { config })
        }

        pub fn config(&self) -> &ParseConfig {
            &self.config
        }
    }

    impl DocumentSource for TreeParser {
        fn load(&self, path: &Path) -> Result<Document> {
            let text = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
            Ok(crate::parser::parse_with_config(&text, &self.config))
        }
    }

}

pub mod query {
    //! Read-models over a parsed tree. These projections interpret what the
    //! parser deliberately stores opaquely (directives) and flatten the
    //! section hierarchy for task-oriented callers.

    pub mod tasks {
        use crate::core::*;
        use chrono::NaiveDate;
        use serde::{Deserialize, Serialize};

        /// Flattened view of one actionable section.
        #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
        pub struct TaskItem {
            pub section: SectionId,
            pub title: String,
            pub todo: Option<TodoKeyword>,
            pub priority: Option<Priority>,
            /// Position in the configured cookie ordering; 0 is most urgent.
            pub priority_rank: Option<usize>,
            pub tags: Vec<Tag>,
            pub scheduled: Option<Timestamp>,
            pub deadline: Option<Timestamp>,
            /// Titles from the document root down to this section.
            pub path: Vec<String>,
        }

        impl TaskItem {
            /// Earliest planning date, for sorting and range filters.
            pub fn next_date(&self) -> Option<NaiveDate> {
                match (&self.scheduled, &self.deadline) {
                    (Some(s), Some(d)) => Some(s.date.min(d.date)),
                    (Some(s), None) => Some(s.date),
                    (None, Some(d)) => Some(d.date),
                    (None, None) => None,
                }
            }
        }

        /// Collect every section carrying a state keyword or planning data.
        pub fn collect(document: &Document, config: &ParseConfig) -> Vec<TaskItem> {
            let mut out = Vec::new();
            let mut path = Vec::new();
            for section in &document.sections {
                walk(section, &mut path, &mut out, config);
            }
            out
        }

        /// Keep tasks whose next date falls inside the inclusive range;
        /// undated tasks always survive.
        pub fn within(
            items: Vec<TaskItem>,
            from: Option<NaiveDate>,
            to: Option<NaiveDate>,
        ) -> Vec<TaskItem> {
            items
                .into_iter()
                .filter(|item| match item.next_date() {
                    None => true,
                    Some(date) => {
                        from.map_or(true, |f| date >= f) && to.map_or(true, |t| date <= t)
                    }
                })
                .collect()
        }

        fn walk(
            section: &Section,
            path: &mut Vec<String>,
            out: &mut Vec<TaskItem>,
            config: &ParseConfig,
        ) {
            path.push(section.title.plain_text());

            let actionable = section.todo.is_some()
                || section.planning.scheduled.is_some()
                || section.planning.deadline.is_some();
            if actionable {
                out.push(TaskItem {
                    section: section.id,
                    title: section.title.plain_text(),
                    todo: section.todo.clone(),
                    priority: section.priority,
                    priority_rank: section.priority.and_then(|p| config.priority_rank(p)),
                    tags: section.tags.iter().cloned().collect(),
                    scheduled: section.planning.scheduled.clone(),
                    deadline: section.planning.deadline.clone(),
                    path: path.clone(),
                });
            }

            for child in &section.children {
                walk(child, path, out, config);
            }
            path.pop();
        }

        #[cfg(test)]
        mod tests {
            use super::*;
            use crate::parser::parse;

            #[test]
            fn collects_actionable_sections_with_paths() {
                let doc =
                    parse("* Projects\n** TODO [#A] Ship it :work:\n** Notes\n*** DONE Review\n");
                let items = collect(&doc, &ParseConfig::default());
                assert_eq!(items.len(), 2);
                assert_eq!(items[0].title, "Ship it");
                assert_eq!(items[0].path, vec!["Projects", "Ship it"]);
                assert_eq!(items[0].priority_rank, Some(0));
                assert_eq!(items[1].path, vec!["Projects", "Notes", "Review"]);
            }

            #[test]
            fn scheduled_only_sections_count() {
                let doc = parse("* Dentist\nSCHEDULED: <2024-06-10>\n");
                let items = collect(&doc, &ParseConfig::default());
                assert_eq!(items.len(), 1);
                assert!(items[0].todo.is_none());
            }

            #[test]
            fn date_range_filter_keeps_undated() {
                let doc = parse(
                    "* TODO Someday\n* TODO Soon\nDEADLINE: <2024-06-01>\n* TODO Late\nDEADLINE: <2024-08-01>\n",
                );
                let items = collect(&doc, &ParseConfig::default());
                let kept = within(items, None, chrono::NaiveDate::from_ymd_opt(2024, 7, 1));
                let titles: Vec<&str> = kept.iter().map(|t| t.title.as_str()).collect();
                assert_eq!(titles, vec!["Someday", "Soon"]);
            }
        }
    }

    pub mod meta {
        use crate::core::{Document, Tag, TodoVocabulary};
        use indexmap::IndexMap;
        use serde::{Deserialize, Serialize};
        use std::collections::BTreeSet;

        /// Interpretation of well-known preamble directives. The parser
        /// stores directives opaquely; meaning is assigned here.
        #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
        pub struct DocumentMeta {
            pub title: Option<String>,
            pub file_tags: BTreeSet<Tag>,
            /// Vocabulary declared by a `#+TODO:` directive, with `|`
            /// splitting not-done from done keywords.
            pub todo: Option<TodoVocabulary>,
            /// Every other preamble directive, keyed lowercase.
            pub keywords: IndexMap<String, String>,
        }

        pub fn of(document: &Document) -> DocumentMeta {
            let mut meta = DocumentMeta::default();
            for directive in &document.preamble.directives {
                match directive.key.to_ascii_lowercase().as_str() {
                    "title" => meta.title = Some(directive.value.trim().to_string()),
                    "filetags" => {
                        for part in directive.value.split(':') {
                            let part = part.trim();
                            if !part.is_empty() {
                                meta.file_tags.insert(Tag::from(part));
                            }
                        }
                    }
                    "todo" => meta.todo = Some(parse_vocabulary(&directive.value)),
                    other => {
                        meta.keywords
                            .insert(other.to_string(), directive.value.to_string());
                    }
                }
            }
            meta
        }

        fn parse_vocabulary(value: &str) -> TodoVocabulary {
            let words: Vec<&str> = value.split_whitespace().collect();
            match words.iter().position(|w| *w == "|") {
                Some(divider) => TodoVocabulary {
                    active: words[..divider].iter().map(|s| s.to_string()).collect(),
                    done: words[divider + 1..].iter().map(|s| s.to_string()).collect(),
                },
                // without a divider the last keyword is the done state
                None => {
                    let (done, active) = match words.split_last() {
                        Some((last, init)) => (
                            vec![last.to_string()],
                            init.iter().map(|s| s.to_string()).collect(),
                        ),
                        None => (vec![], vec![]),
                    };
                    TodoVocabulary { active, done }
                }
            }
        }

    }
}

pub use crate::core::{Document, ParseConfig};
pub use parser::{parse, parse_with_config};
pub use storage::{DocumentSource, TreeParser};
