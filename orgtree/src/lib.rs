//! Org outline parsing into a typed, arena-backed tree.
//! The core (`lexer`, `grammar`, `builder`) is pure and synchronous; `storage`, `config`
//! and the binary layer file I/O and settings on top of it.

pub mod core {
    use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
    use indexmap::IndexSet;
    use serde::ser::SerializeStruct;
    use serde::{Deserialize, Serialize, Serializer};
    use std::fmt;

    /* ------------------------------- IDs ------------------------------- */

    /// Index of a node inside its [`Outline`] arena.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct NodeId(pub usize);

    impl fmt::Display for NodeId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    /// A node id that is known to point at a heading.
    ///
    /// Only [`Outline::add_heading_child`] and [`Outline::as_heading`] hand these out,
    /// so text can never be attached below a text node or the root.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct HeadingId(NodeId);

    impl HeadingId {
        pub fn node(self) -> NodeId {
            self.0
        }
    }

    /// Anything that can own headings: the root or another heading.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Container {
        Root,
        Heading(HeadingId),
    }

    impl Container {
        pub fn node(self) -> NodeId {
            match self {
                Container::Root => Outline::ROOT,
                Container::Heading(h) => h.0,
            }
        }
    }

    impl From<HeadingId> for Container {
        fn from(h: HeadingId) -> Self {
            Container::Heading(h)
        }
    }

    /* ---------------------------- Value Objects ---------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum NodeKind {
        Root,
        Heading,
        Text,
    }

    impl NodeKind {
        pub fn as_str(self) -> &'static str {
            match self {
                NodeKind::Root => "root",
                NodeKind::Heading => "heading",
                NodeKind::Text => "text",
            }
        }
    }

    /// Headline status keyword: nothing, `TODO`, or `DONE`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum Status {
        #[default]
        None,
        Open,
        Done,
    }

    impl Status {
        pub fn is_unset(&self) -> bool {
            matches!(self, Status::None)
        }

        /// Keyword as written in a headline, if any.
        pub fn keyword(self) -> Option<&'static str> {
            match self {
                Status::None => None,
                Status::Open => Some("TODO"),
                Status::Done => Some("DONE"),
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct Tag(pub String);

    impl Tag {
        pub fn as_str(&self) -> &str {
            &self.0
        }
    }

    impl From<&str> for Tag {
        fn from(s: &str) -> Self {
            Self(s.to_string())
        }
    }

    /// A planning timestamp such as `<2024-01-05 Fri 10:00-11:30>`.
    #[serde_with::skip_serializing_none]
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Timestamp {
        /// `<...>` is active, `[...]` inactive.
        pub active: bool,
        pub date: NaiveDate,
        pub time: Option<NaiveTime>,
        /// End of a same-day `HH:MM-HH:MM` range.
        pub end_time: Option<NaiveTime>,
    }

    impl Timestamp {
        pub fn on(date: NaiveDate) -> Self {
            Self {
                active: true,
                date,
                time: None,
                end_time: None,
            }
        }

        /// Start instant; all-day timestamps start at midnight.
        pub fn start(&self) -> NaiveDateTime {
            self.date.and_time(self.time.unwrap_or_default())
        }

        pub fn end(&self) -> Option<NaiveDateTime> {
            self.end_time.map(|t| self.date.and_time(t))
        }
    }

    /// The three scheduling keywords a body line may carry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum PlanningKey {
        Deadline,
        Scheduled,
        Closed,
    }

    impl PlanningKey {
        /// Scan order used by the annotation grammar.
        pub const ALL: [PlanningKey; 3] = [
            PlanningKey::Deadline,
            PlanningKey::Scheduled,
            PlanningKey::Closed,
        ];

        pub fn keyword(self) -> &'static str {
            match self {
                PlanningKey::Deadline => "DEADLINE",
                PlanningKey::Scheduled => "SCHEDULED",
                PlanningKey::Closed => "CLOSED",
            }
        }

        pub fn as_str(self) -> &'static str {
            match self {
                PlanningKey::Deadline => "deadline",
                PlanningKey::Scheduled => "scheduled",
                PlanningKey::Closed => "closed",
            }
        }

        /// `CLOSED` takes an inactive `[...]` stamp, the others an active `<...>` one.
        pub fn brackets(self) -> (char, char) {
            match self {
                PlanningKey::Closed => ('[', ']'),
                _ => ('<', '>'),
            }
        }

        pub fn get(self, attrs: &Attrs) -> Option<&Timestamp> {
            match self {
                PlanningKey::Deadline => attrs.deadline.as_ref(),
                PlanningKey::Scheduled => attrs.scheduled.as_ref(),
                PlanningKey::Closed => attrs.closed.as_ref(),
            }
        }

        pub(crate) fn slot(self, attrs: &mut Attrs) -> &mut Option<Timestamp> {
            match self {
                PlanningKey::Deadline => &mut attrs.deadline,
                PlanningKey::Scheduled => &mut attrs.scheduled,
                PlanningKey::Closed => &mut attrs.closed,
            }
        }
    }

    impl fmt::Display for PlanningKey {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.keyword())
        }
    }

    /// Fixed attribute record carried by every node; only headings ever fill it.
    #[serde_with::skip_serializing_none]
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct Attrs {
        #[serde(default, skip_serializing_if = "Status::is_unset")]
        pub status: Status,
        #[serde(default, skip_serializing_if = "IndexSet::is_empty")]
        pub tags: IndexSet<Tag>,
        pub deadline: Option<Timestamp>,
        pub scheduled: Option<Timestamp>,
        pub closed: Option<Timestamp>,
    }

    impl Attrs {
        pub fn is_empty(&self) -> bool {
            self.status.is_unset()
                && self.tags.is_empty()
                && self.deadline.is_none()
                && self.scheduled.is_none()
                && self.closed.is_none()
        }

        pub fn has_tag(&self, tag: &str) -> bool {
            self.tags.iter().any(|t| t.0 == tag)
        }

        /// Merge `other` into `self` field by field. Set fields of `other` win;
        /// unset fields leave the existing value alone.
        pub fn merge(&mut self, other: Attrs) {
            if !other.status.is_unset() {
                self.status = other.status;
            }
            for key in PlanningKey::ALL {
                if let Some(ts) = key.get(&other) {
                    *key.slot(self) = Some(ts.clone());
                }
            }
            self.tags.extend(other.tags);
        }

        /// Planning entries that are set, in `PlanningKey::ALL` order.
        pub fn planning(&self) -> impl Iterator<Item = (PlanningKey, &Timestamp)> {
            PlanningKey::ALL
                .into_iter()
                .filter_map(move |key| key.get(self).map(|ts| (key, ts)))
        }
    }

    /// Output of the headline grammar.
    #[derive(Debug, Clone, PartialEq, Eq, Default)]
    pub struct HeadingTitle {
        pub status: Status,
        pub tags: IndexSet<Tag>,
        pub title: String,
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    /// Every way parsing a document can fail. The first error aborts the parse.
    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum ParseError {
        #[error("line {line}: malformed timestamp {payload:?}")]
        MalformedTimestamp { line: usize, payload: String },
        #[error("node {id} cannot take this child: {reason}")]
        InvalidChild { id: NodeId, reason: &'static str },
        #[error("line {line}: body text outside of any heading")]
        StructureError { line: usize },
        #[error("line {line}: unsupported lexeme: {reason}")]
        UnsupportedLexeme { line: usize, reason: &'static str },
        #[error("line {line}: {key} given more than once")]
        ConflictingAnnotation { line: usize, key: PlanningKey },
    }

    impl ParseError {
        /// Attach a source line to errors raised by line-agnostic grammar helpers.
        pub fn at_line(mut self, at: usize) -> Self {
            match &mut self {
                ParseError::MalformedTimestamp { line, .. }
                | ParseError::StructureError { line }
                | ParseError::UnsupportedLexeme { line, .. }
                | ParseError::ConflictingAnnotation { line, .. } => *line = at,
                ParseError::InvalidChild { .. } => {}
            }
            self
        }
    }

    /* ------------------------------ Aggregate ------------------------------ */

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Node {
        kind: NodeKind,
        parent: Option<NodeId>,
        children: Vec<NodeId>,
        text: String,
        attrs: Attrs,
        depth: usize,
    }

    /// Aggregate root: one parsed document. Nodes live in an arena in document
    /// (pre-order) order; parents are plain ids, never owners.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Outline {
        nodes: Vec<Node>,
    }

    impl Default for Outline {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Outline {
        pub const ROOT: NodeId = NodeId(0);

        pub fn new() -> Self {
            Self {
                nodes: vec![Node {
                    kind: NodeKind::Root,
                    parent: None,
                    children: vec![],
                    text: String::new(),
                    attrs: Attrs::default(),
                    depth: 0,
                }],
            }
        }

        pub fn root(&self) -> NodeRef<'_> {
            NodeRef {
                outline: self,
                id: Self::ROOT,
                node: &self.nodes[0],
            }
        }

        pub fn get(&self, id: NodeId) -> Option<NodeRef<'_>> {
            self.nodes.get(id.0).map(|node| NodeRef {
                outline: self,
                id,
                node,
            })
        }

        /// Total node count, root included.
        pub fn node_count(&self) -> usize {
            self.nodes.len()
        }

        pub fn children(&self, id: NodeId) -> &[NodeId] {
            self.nodes
                .get(id.0)
                .map(|n| n.children.as_slice())
                .unwrap_or_default()
        }

        pub fn last_child(&self, id: NodeId) -> Option<NodeId> {
            self.children(id).last().copied()
        }

        pub fn parent(&self, id: NodeId) -> Option<NodeId> {
            self.nodes.get(id.0).and_then(|n| n.parent)
        }

        /// All headings in document order.
        pub fn headings(&self) -> impl Iterator<Item = NodeRef<'_>> {
            (0..self.nodes.len())
                .filter_map(|i| self.get(NodeId(i)))
                .filter(|n| n.kind() == NodeKind::Heading)
        }

        pub fn as_heading(&self, id: NodeId) -> Result<HeadingId, ParseError> {
            match self.nodes.get(id.0) {
                Some(n) if n.kind == NodeKind::Heading => Ok(HeadingId(id)),
                Some(_) => Err(ParseError::InvalidChild {
                    id,
                    reason: "only headings take text and attributes",
                }),
                None => Err(ParseError::InvalidChild {
                    id,
                    reason: "unknown node",
                }),
            }
        }

        /// Append a heading below `parent`. `depth` must exceed the parent's depth.
        pub fn add_heading_child(
            &mut self,
            parent: impl Into<Container>,
            depth: usize,
            title: HeadingTitle,
        ) -> Result<HeadingId, ParseError> {
            let parent = parent.into().node();
            let parent_depth = match parent {
                Self::ROOT => 0,
                _ => self.heading_mut(HeadingId(parent))?.depth,
            };
            if depth <= parent_depth {
                return Err(ParseError::InvalidChild {
                    id: parent,
                    reason: "heading depth must exceed its parent's",
                });
            }

            let id = NodeId(self.nodes.len());
            self.nodes.push(Node {
                kind: NodeKind::Heading,
                parent: Some(parent),
                children: vec![],
                text: title.title,
                attrs: Attrs {
                    status: title.status,
                    tags: title.tags,
                    ..Attrs::default()
                },
                depth,
            });
            self.nodes[parent.0].children.push(id);
            Ok(HeadingId(id))
        }

        pub fn add_text_child(
            &mut self,
            heading: HeadingId,
            text: impl Into<String>,
        ) -> Result<NodeId, ParseError> {
            self.heading_mut(heading)?;
            let id = NodeId(self.nodes.len());
            self.nodes.push(Node {
                kind: NodeKind::Text,
                parent: Some(heading.0),
                children: vec![],
                text: text.into(),
                attrs: Attrs::default(),
                depth: 0,
            });
            self.nodes[heading.0.0].children.push(id);
            Ok(id)
        }

        pub fn add_attrs(&mut self, heading: HeadingId, attrs: Attrs) -> Result<(), ParseError> {
            self.heading_mut(heading)?.attrs.merge(attrs);
            Ok(())
        }

        fn heading_mut(&mut self, heading: HeadingId) -> Result<&mut Node, ParseError> {
            let id = heading.0;
            match self.nodes.get_mut(id.0) {
                Some(n) if n.kind == NodeKind::Heading => Ok(n),
                _ => Err(ParseError::InvalidChild {
                    id,
                    reason: "not a heading of this outline",
                }),
            }
        }
    }

    /// Borrowed view of one node with navigation helpers.
    #[derive(Debug, Clone, Copy)]
    pub struct NodeRef<'a> {
        outline: &'a Outline,
        id: NodeId,
        node: &'a Node,
    }

    impl<'a> NodeRef<'a> {
        pub fn id(&self) -> NodeId {
            self.id
        }

        pub fn kind(&self) -> NodeKind {
            self.node.kind
        }

        pub fn text(&self) -> &'a str {
            &self.node.text
        }

        pub fn attrs(&self) -> &'a Attrs {
            &self.node.attrs
        }

        /// Star count for headings, 0 for the root and text nodes.
        pub fn depth(&self) -> usize {
            self.node.depth
        }

        pub fn has_tag(&self, tag: &str) -> bool {
            self.node.attrs.has_tag(tag)
        }

        pub fn as_heading(&self) -> Option<HeadingId> {
            (self.node.kind == NodeKind::Heading).then_some(HeadingId(self.id))
        }

        pub fn parent(self) -> Option<NodeRef<'a>> {
            self.node.parent.and_then(|p| self.outline.get(p))
        }

        pub fn child_ids(self) -> &'a [NodeId] {
            &self.node.children
        }

        pub fn children(self) -> impl Iterator<Item = NodeRef<'a>> {
            let outline = self.outline;
            self.node
                .children
                .iter()
                .filter_map(move |&id| outline.get(id))
        }

        pub fn last_child(self) -> Option<NodeRef<'a>> {
            self.node
                .children
                .last()
                .and_then(|&id| self.outline.get(id))
        }

        /// Parent, grandparent, ... up to and including the root.
        pub fn ancestors(self) -> impl Iterator<Item = NodeRef<'a>> {
            std::iter::successors(self.parent(), |n| n.parent())
        }

        /// Nesting level in the tree (root = 0), independent of star depth.
        pub fn level(self) -> usize {
            self.ancestors().count()
        }
    }

    impl Serialize for NodeRef<'_> {
        fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            let children: Vec<NodeRef<'_>> = self.children().collect();
            let mut st = serializer.serialize_struct("Node", 5)?;
            st.serialize_field("kind", &self.kind())?;
            st.serialize_field("depth", &self.depth())?;
            st.serialize_field("text", self.text())?;
            st.serialize_field("attrs", self.attrs())?;
            st.serialize_field("children", &children)?;
            st.end()
        }
    }

    impl Serialize for Outline {
        fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            self.root().serialize(serializer)
        }
    }

}

pub mod lexer {
    //! Line classification: every physical line becomes part of exactly one lexeme.

    use nom::{
        IResult, bytes::complete::take_while1, character::complete::char, sequence::terminated,
    };

    /// Body lines starting with one of these are planning lines and stand alone.
    pub const ANNOTATION_PREFIXES: [&str; 2] = ["DEADLINE: ", "SCHEDULED: "];

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum LexemeKind {
        Heading { depth: usize },
        /// `annotation` marks a standalone planning line that never absorbs neighbours.
        Paragraph { annotation: bool },
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Lexeme {
        pub kind: LexemeKind,
        /// Source text: the whole line for headings, `\n`-joined lines for paragraphs.
        pub raw: String,
        /// 1-based line of the first constituent line.
        pub line: usize,
    }

    impl Lexeme {
        /// Headline text after the star run and its separating space.
        pub fn title(&self) -> Option<&str> {
            match self.kind {
                LexemeKind::Heading { depth } => self.raw.get(depth + 1..),
                LexemeKind::Paragraph { .. } => None,
            }
        }
    }

    /// Split `text` into lexemes in document order. Never fails.
    pub fn tokenize(text: &str) -> Vec<Lexeme> {
        let mut out: Vec<Lexeme> = Vec::new();

        for (idx, line) in text.lines().enumerate() {
            let line_no = idx + 1;

            if let Some(depth) = heading_depth(line) {
                out.push(Lexeme {
                    kind: LexemeKind::Heading { depth },
                    raw: line.to_string(),
                    line: line_no,
                });
                continue;
            }

            if is_annotation_line(line) {
                out.push(Lexeme {
                    kind: LexemeKind::Paragraph { annotation: true },
                    raw: line.to_string(),
                    line: line_no,
                });
                continue;
            }

            match out.last_mut() {
                Some(Lexeme {
                    kind: LexemeKind::Paragraph { annotation: false },
                    raw,
                    ..
                }) => {
                    raw.push('\n');
                    raw.push_str(line);
                }
                _ => out.push(Lexeme {
                    kind: LexemeKind::Paragraph { annotation: false },
                    raw: line.to_string(),
                    line: line_no,
                }),
            }
        }

        log::trace!("tokenized {} lexemes", out.len());
        out
    }

    /// Star count when `line` is a headline (`*+ ` prefix).
    pub fn heading_depth(line: &str) -> Option<usize> {
        let parsed: IResult<&str, &str> =
            terminated(take_while1(|c: char| c == '*'), char(' '))(line);
        parsed.ok().map(|(_, stars)| stars.len())
    }

    pub fn is_annotation_line(line: &str) -> bool {
        ANNOTATION_PREFIXES.iter().any(|p| line.starts_with(p))
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use proptest::prelude::*;

        #[test]
        fn empty_document_has_no_lexemes() {
            assert!(tokenize("").is_empty());
        }

        #[test]
        fn headings_carry_depth_and_title() {
            let lx = tokenize("* One\n*** Three :x:\n* ");
            assert_eq!(lx.len(), 3);
            assert_eq!(lx[0].kind, LexemeKind::Heading { depth: 1 });
            assert_eq!(lx[0].title(), Some("One"));
            assert_eq!(lx[1].kind, LexemeKind::Heading { depth: 3 });
            assert_eq!(lx[1].title(), Some("Three :x:"));
            assert_eq!(lx[2].title(), Some(""));
        }

        #[test]
        fn stars_without_space_are_body_text() {
            let lx = tokenize("* Top\n**bold** text\n*");
            assert_eq!(lx.len(), 2);
            assert_eq!(lx[1].kind, LexemeKind::Paragraph { annotation: false });
            assert_eq!(lx[1].raw, "**bold** text\n*");
        }

        #[test]
        fn consecutive_body_lines_merge() {
            let lx = tokenize("* H\none\ntwo\n\nthree\n* Next");
            assert_eq!(lx.len(), 3);
            assert_eq!(lx[1].raw, "one\ntwo\n\nthree");
            assert_eq!(lx[1].line, 2);
            assert_eq!(lx[2].line, 6);
        }

        #[test]
        fn planning_lines_stand_alone() {
            let lx = tokenize(
                "* H\nnote\nDEADLINE: <2024-01-05 Fri>\nSCHEDULED: <2024-01-04 Thu>\nafter",
            );
            let kinds: Vec<_> = lx.iter().map(|l| l.kind).collect();
            assert_eq!(
                kinds,
                vec![
                    LexemeKind::Heading { depth: 1 },
                    LexemeKind::Paragraph { annotation: false },
                    LexemeKind::Paragraph { annotation: true },
                    LexemeKind::Paragraph { annotation: true },
                    LexemeKind::Paragraph { annotation: false },
                ]
            );
            assert_eq!(lx[4].raw, "after");
        }

        #[test]
        fn closed_lines_merge_like_plain_text() {
            let lx = tokenize("* H\nnote\nCLOSED: [2024-01-05 Fri]");
            assert_eq!(lx.len(), 2);
            assert_eq!(lx[1].raw, "note\nCLOSED: [2024-01-05 Fri]");
        }

        fn line_strategy() -> impl Strategy<Value = String> {
            prop_oneof![
                "\\*{1,4} [a-zA-Z :]{0,12}",
                "[a-zA-Z* ]{0,16}",
                Just("DEADLINE: <2024-01-05 Fri>".to_string()),
                Just("SCHEDULED: <2024-01-05 Fri 09:00>".to_string()),
                Just(String::new()),
            ]
        }

        proptest! {
            #[test]
            fn every_line_lands_in_exactly_one_lexeme(
                lines in proptest::collection::vec(line_strategy(), 0..24)
            ) {
                let text = lines.join("\n");
                let lexemes = tokenize(&text);

                let rebuilt: Vec<&str> = lexemes.iter().flat_map(|l| l.raw.split('\n')).collect();
                let original: Vec<&str> = text.lines().collect();
                prop_assert_eq!(rebuilt, original);

                for pair in lexemes.windows(2) {
                    prop_assert!(pair[0].line < pair[1].line);
                }
            }
        }
    }
}

pub mod grammar {
    //! Pure `nom` grammars for headline titles and planning annotations.

    use crate::core::{Attrs, HeadingTitle, ParseError, PlanningKey, Status, Tag, Timestamp};
    use chrono::{NaiveDate, NaiveTime};
    use indexmap::IndexSet;
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{tag, take_till1, take_while_m_n, take_while1},
        character::complete::{alpha1, char, multispace0, space0, space1},
        combinator::{eof, map_opt, map_res, opt, value},
        error::{VerboseError, convert_error},
        multi::many1,
        sequence::{pair, preceded, separated_pair, terminated, tuple},
    };
    use std::str::FromStr;

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /* ----------------------------- Headlines ----------------------------- */

    /// Split a headline's title into status, tags and the cleaned text.
    pub fn parse_heading_title(raw: &str) -> HeadingTitle {
        let (rest, status) = status_keyword(raw.trim_start());
        let (title, tags) = extract_tags(rest);
        HeadingTitle {
            status,
            tags,
            title: title.trim().to_string(),
        }
    }

    fn status_keyword(i: &str) -> (&str, Status) {
        let parsed: PResult<'_, Status> = alt((
            value(Status::Open, tag("TODO ")),
            value(Status::Done, terminated(tag("DONE"), alt((space1, eof)))),
        ))(i);
        match parsed {
            Ok((rest, status)) => (rest, status),
            Err(_) => (i, Status::None),
        }
    }

    /// Remove every `:a:` / `:a:b:` run from `s`, collecting the names in order.
    /// Names may contain spaces (`:big project:`); they are trimmed, and runs
    /// whose names trim to nothing are removed without adding a tag.
    pub fn extract_tags(s: &str) -> (String, IndexSet<Tag>) {
        let mut text = String::with_capacity(s.len());
        let mut tags = IndexSet::new();
        let mut rest = s;

        while let Some(pos) = rest.find(':') {
            text.push_str(&rest[..pos]);
            let at = &rest[pos..];
            match tag_run(at) {
                Ok((after, names)) => {
                    tags.extend(
                        names
                            .into_iter()
                            .map(str::trim)
                            .filter(|n| !n.is_empty())
                            .map(Tag::from),
                    );
                    rest = after;
                }
                Err(_) => {
                    text.push(':');
                    rest = &at[1..];
                }
            }
        }
        text.push_str(rest);

        (text, tags)
    }

    fn tag_run(i: &str) -> PResult<'_, Vec<&str>> {
        preceded(
            char(':'),
            many1(terminated(take_while1(is_tag_char), char(':'))),
        )(i)
    }

    fn is_tag_char(c: char) -> bool {
        c != ':'
    }

    /* ----------------------------- Planning ----------------------------- */

    /// Result of scanning a paragraph for planning annotations.
    #[derive(Debug, Clone, PartialEq, Eq, Default)]
    pub struct Annotations<'a> {
        pub attrs: Attrs,
        /// The untouched input when nothing matched, `None` once anything did.
        pub remaining: Option<&'a str>,
    }

    /// Strip leading `DEADLINE: <..>`, `SCHEDULED: <..>` and `CLOSED: [..]` entries,
    /// in any order and any number, until a full scan finds none.
    ///
    /// Errors carry line 0; callers re-anchor them with [`ParseError::at_line`].
    pub fn parse_annotations(raw: &str) -> Result<Annotations<'_>, ParseError> {
        let mut attrs = Attrs::default();
        let mut rest = raw;
        let mut captured = false;

        loop {
            let mut matched = false;
            for key in PlanningKey::ALL {
                let Ok((after, payload)) = planning_entry(rest, key) else {
                    continue;
                };
                let slot = key.slot(&mut attrs);
                if slot.is_some() {
                    return Err(ParseError::ConflictingAnnotation { line: 0, key });
                }
                *slot = Some(parse_timestamp(payload, key.brackets().0 == '<')?);
                rest = after;
                matched = true;
                captured = true;
            }
            if !matched {
                break;
            }
        }

        Ok(Annotations {
            attrs,
            remaining: (!captured).then_some(raw),
        })
    }

    fn planning_entry(i: &str, key: PlanningKey) -> PResult<'_, &str> {
        let (open, close) = key.brackets();
        let (i, _) = tag(key.keyword())(i)?;
        let (i, _) = tag(": ")(i)?;
        let (i, _) = char(open)(i)?;
        let (i, payload) = take_till1(|c| c == close)(i)?;
        let (i, _) = char(close)(i)?;
        let (i, _) = multispace0(i)?;
        Ok((i, payload))
    }

    /* ----------------------------- Timestamps ----------------------------- */

    /// Parse a bracket payload of the form `YYYY-MM-DD Day [HH:MM[-HH:MM]]`.
    pub fn parse_timestamp(payload: &str, active: bool) -> Result<Timestamp, ParseError> {
        match timestamp_payload(payload) {
            Ok((_, (date, times))) => Ok(Timestamp {
                active,
                date,
                time: times.map(|(start, _)| start),
                end_time: times.and_then(|(_, end)| end),
            }),
            Err(e) => {
                if let nom::Err::Error(ve) | nom::Err::Failure(ve) = e {
                    log::debug!("timestamp rejected:\n{}", convert_error(payload, ve));
                }
                Err(ParseError::MalformedTimestamp {
                    line: 0,
                    payload: payload.to_string(),
                })
            }
        }
    }

    type TimeRange = (NaiveTime, Option<NaiveTime>);

    fn timestamp_payload(i: &str) -> PResult<'_, (NaiveDate, Option<TimeRange>)> {
        let day = map_opt(
            tuple((
                digits::<i32>(4, 4),
                preceded(char('-'), digits::<u32>(2, 2)),
                preceded(char('-'), digits::<u32>(2, 2)),
            )),
            |(y, m, d)| NaiveDate::from_ymd_opt(y, m, d),
        );
        let clock = || {
            map_opt(
                separated_pair(digits::<u32>(1, 2), char(':'), digits::<u32>(2, 2)),
                |(h, m)| NaiveTime::from_hms_opt(h, m, 0),
            )
        };

        let (i, (_, date, _, _weekday, times, _, _)) = tuple((
            space0,
            day,
            space1,
            alpha1,
            opt(preceded(
                space1,
                pair(clock(), opt(preceded(char('-'), clock()))),
            )),
            space0,
            eof,
        ))(i)?;
        Ok((i, (date, times)))
    }

    /// `min..=max` ASCII digits parsed as `T`.
    fn digits<'a, T: FromStr>(min: usize, max: usize) -> impl FnMut(&'a str) -> PResult<'a, T> {
        map_res(
            take_while_m_n(min, max, |c: char| c.is_ascii_digit()),
            |s: &str| s.parse::<T>(),
        )
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use proptest::prelude::*;

        fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
            NaiveDate::from_ymd_opt(y, m, d).unwrap()
        }

        fn hm(h: u32, m: u32) -> NaiveTime {
            NaiveTime::from_hms_opt(h, m, 0).unwrap()
        }

        #[test]
        fn todo_with_tag() {
            let t = parse_heading_title("TODO Buy milk :errand:");
            assert_eq!(t.status, Status::Open);
            assert_eq!(t.title, "Buy milk");
            assert_eq!(t.tags.iter().map(Tag::as_str).collect::<Vec<_>>(), ["errand"]);
        }

        #[test]
        fn done_variants() {
            assert_eq!(parse_heading_title("DONE Ship it").status, Status::Done);
            assert_eq!(parse_heading_title("DONE Ship it").title, "Ship it");

            let bare = parse_heading_title("DONE");
            assert_eq!(bare.status, Status::Done);
            assert_eq!(bare.title, "");

            let word = parse_heading_title("DONEish work");
            assert_eq!(word.status, Status::None);
            assert_eq!(word.title, "DONEish work");
        }

        #[test]
        fn no_keyword_keeps_text() {
            let t = parse_heading_title("Plain title");
            assert_eq!(t.status, Status::None);
            assert_eq!(t.title, "Plain title");
            assert!(t.tags.is_empty());

            assert_eq!(parse_heading_title("TODO").status, Status::None);
        }

        #[test]
        fn multi_tag_runs_and_scattered_tags() {
            let t = parse_heading_title("Plan :work:q1: trip");
            assert_eq!(t.title, "Plan  trip");
            assert_eq!(
                t.tags.iter().map(Tag::as_str).collect::<Vec<_>>(),
                ["work", "q1"]
            );

            let t = parse_heading_title("Pack :travel: bags");
            assert_eq!(t.title, "Pack  bags");
            assert!(t.tags.contains(&Tag::from("travel")));
        }

        #[test]
        fn tag_names_may_contain_spaces() {
            let t = parse_heading_title("Meeting :big project:");
            assert_eq!(t.title, "Meeting");
            assert_eq!(
                t.tags.iter().map(Tag::as_str).collect::<Vec<_>>(),
                ["big project"]
            );

            let t = parse_heading_title("Meet at 10:30 re: budget");
            assert_eq!(t.title, "Meet at 10 budget");
            assert_eq!(
                t.tags.iter().map(Tag::as_str).collect::<Vec<_>>(),
                ["30 re"]
            );
        }

        #[test]
        fn unpaired_colons_survive() {
            let t = parse_heading_title("Ratio 3:2 review");
            assert!(t.tags.is_empty());
            assert_eq!(t.title, "Ratio 3:2 review");

            let t = parse_heading_title("Later:: maybe");
            assert!(t.tags.is_empty());
            assert_eq!(t.title, "Later:: maybe");

            let t = parse_heading_title("Odd : : end");
            assert!(t.tags.is_empty());
            assert_eq!(t.title, "Odd  end");
        }

        #[test]
        fn metadata_only_heading_has_empty_title() {
            let t = parse_heading_title("TODO :inbox:");
            assert_eq!(t.status, Status::Open);
            assert_eq!(t.title, "");
            assert!(t.tags.contains(&Tag::from("inbox")));
        }

        #[test]
        fn deadline_line() {
            let a = parse_annotations("DEADLINE: <2024-01-05 Fri>").unwrap();
            assert_eq!(a.remaining, None);
            let deadline = a.attrs.deadline.unwrap();
            assert_eq!(deadline.date, ymd(2024, 1, 5));
            assert!(deadline.active);
            assert_eq!(deadline.time, None);
        }

        #[test]
        fn several_annotations_in_any_order() {
            let a = parse_annotations(
                "CLOSED: [2024-01-06 Sat 17:45] DEADLINE: <2024-01-05 Fri 09:00-10:30>",
            )
            .unwrap();
            let closed = a.attrs.closed.unwrap();
            assert!(!closed.active);
            assert_eq!(closed.time, Some(hm(17, 45)));

            let deadline = a.attrs.deadline.unwrap();
            assert_eq!(deadline.time, Some(hm(9, 0)));
            assert_eq!(deadline.end_time, Some(hm(10, 30)));
            assert_eq!(a.attrs.scheduled, None);
        }

        #[test]
        fn plain_text_is_returned_untouched() {
            let a = parse_annotations("just a note\nDEADLINE: <2024-01-05 Fri>").unwrap();
            assert!(a.attrs.is_empty());
            assert_eq!(a.remaining, Some("just a note\nDEADLINE: <2024-01-05 Fri>"));
        }

        #[test]
        fn malformed_payload_is_an_error() {
            let err = parse_annotations("DEADLINE: <not-a-date>").unwrap_err();
            assert_eq!(
                err,
                ParseError::MalformedTimestamp {
                    line: 0,
                    payload: "not-a-date".into()
                }
            );

            assert!(parse_timestamp("2024-02-30 Fri", true).is_err());
            assert!(parse_timestamp("2024-01-05", true).is_err());
            assert!(parse_timestamp("2024-01-05 Fri 25:00", true).is_err());
            assert!(parse_timestamp("2024-01-05 Fri +1w", true).is_err());
        }

        #[test]
        fn repeated_key_in_one_paragraph_is_rejected() {
            let err =
                parse_annotations("DEADLINE: <2024-01-05 Fri> DEADLINE: <2024-01-06 Sat>")
                    .unwrap_err();
            assert!(matches!(
                err,
                ParseError::ConflictingAnnotation {
                    key: PlanningKey::Deadline,
                    ..
                }
            ));
        }

        #[test]
        fn timestamp_tolerates_padding() {
            let ts = parse_timestamp(" 2024-01-05 Fri 9:05 ", false).unwrap();
            assert_eq!(ts.time, Some(hm(9, 5)));
            assert!(!ts.active);
        }

        proptest! {
            #[test]
            fn tag_extraction_is_idempotent(title in "[a-z :]{0,32}") {
                let first = parse_heading_title(&title);
                let second = parse_heading_title(&first.title);
                prop_assert!(second.tags.is_empty());
                prop_assert_eq!(second.title, first.title);
            }

            #[test]
            fn captured_annotations_match_the_input(
                day in 1u32..=28,
                with_deadline in any::<bool>(),
                with_scheduled in any::<bool>(),
                with_closed in any::<bool>(),
            ) {
                let mut parts = Vec::new();
                if with_deadline { parts.push(format!("DEADLINE: <2024-03-{day:02} Mon>")); }
                if with_scheduled { parts.push(format!("SCHEDULED: <2024-03-{day:02} Mon 08:00>")); }
                if with_closed { parts.push(format!("CLOSED: [2024-03-{day:02} Mon]")); }
                let line = parts.join(" ");

                let a = parse_annotations(&line).unwrap();
                prop_assert_eq!(a.attrs.deadline.is_some(), with_deadline);
                prop_assert_eq!(a.attrs.scheduled.is_some(), with_scheduled);
                prop_assert_eq!(a.attrs.closed.is_some(), with_closed);
                if let Some(rest) = a.remaining {
                    prop_assert!(!rest.contains("DEADLINE: <"));
                    prop_assert!(parts.is_empty());
                }
            }
        }
    }
}

pub mod builder {
    //! Tree construction: replays lexemes against a stack of open headings.

    use crate::core::{Container, HeadingId, Outline, ParseError};
    use crate::grammar::{Annotations, parse_annotations, parse_heading_title};
    use crate::lexer::{Lexeme, LexemeKind, tokenize};
    use crate::storage::OutlineParser;
    use anyhow::{Context, Result};
    use serde::{Deserialize, Serialize};
    use std::{fs, path::Path};

    /// What to do with body text or planning lines that appear before the first heading.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum OrphanText {
        /// Fail with [`ParseError::StructureError`].
        #[default]
        Reject,
        /// Discard it and log a warning.
        Drop,
    }

    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct ParseOptions {
        pub orphan_text: OrphanText,
    }

    /// Parse a whole document.
    pub fn parse_str(text: &str, opts: &ParseOptions) -> Result<Outline, ParseError> {
        build_tree(tokenize(text), opts)
    }

    /// Build the tree from lexemes in document order.
    pub fn build_tree(
        lexemes: impl IntoIterator<Item = Lexeme>,
        opts: &ParseOptions,
    ) -> Result<Outline, ParseError> {
        let mut outline = Outline::new();
        // open headings, outermost first; the root sits implicitly below index 0
        let mut open: Vec<(HeadingId, usize)> = Vec::new();

        for lexeme in lexemes {
            match lexeme.kind {
                LexemeKind::Heading { depth } => {
                    if depth == 0 {
                        return Err(ParseError::UnsupportedLexeme {
                            line: lexeme.line,
                            reason: "heading without a star marker",
                        });
                    }
                    let Some(raw_title) = lexeme.title() else {
                        return Err(ParseError::UnsupportedLexeme {
                            line: lexeme.line,
                            reason: "heading text shorter than its marker",
                        });
                    };

                    while open.last().is_some_and(|&(_, d)| d >= depth) {
                        open.pop();
                    }
                    let parent = open
                        .last()
                        .map_or(Container::Root, |&(h, _)| Container::Heading(h));

                    let id = outline.add_heading_child(parent, depth, parse_heading_title(raw_title))?;
                    log::trace!(
                        "line {}: heading depth {} under node {}",
                        lexeme.line,
                        depth,
                        parent.node().0
                    );
                    open.push((id, depth));
                }
                LexemeKind::Paragraph { .. } => {
                    let Annotations { attrs, remaining } =
                        parse_annotations(&lexeme.raw).map_err(|e| e.at_line(lexeme.line))?;
                    let text = remaining.map(normalize_body).filter(|t| !t.is_empty());

                    match open.last() {
                        Some(&(heading, _)) => {
                            if let Some(text) = text {
                                outline.add_text_child(heading, text)?;
                            }
                            if !attrs.is_empty() {
                                outline.add_attrs(heading, attrs)?;
                            }
                        }
                        None if text.is_none() && attrs.is_empty() => {}
                        None => match opts.orphan_text {
                            OrphanText::Reject => {
                                return Err(ParseError::StructureError { line: lexeme.line });
                            }
                            OrphanText::Drop => {
                                log::warn!(
                                    "line {}: dropping body text before the first heading",
                                    lexeme.line
                                );
                            }
                        },
                    }
                }
            }
        }

        log::debug!("built outline with {} nodes", outline.node_count());
        Ok(outline)
    }

    /// Trim each body line and drop blank lines at either end.
    fn normalize_body(raw: &str) -> String {
        let lines: Vec<&str> = raw.lines().map(str::trim).collect();
        let start = lines.iter().position(|l| !l.is_empty());
        let end = lines.iter().rposition(|l| !l.is_empty());
        match (start, end) {
            (Some(s), Some(e)) => lines[s..=e].join("\n"),
            _ => String::new(),
        }
    }

    /// File-backed parser implementing the `storage::OutlineParser` seam.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct NomOutlineParser {
        pub options: ParseOptions,
    }

    impl OutlineParser for NomOutlineParser {
        fn parse_file(&self, path: &Path) -> Result<Outline> {
            let text = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
            let outline =
                parse_str(&text, &self.options).with_context(|| format!("parsing {:?}", path))?;
            Ok(outline)
        }
    }

}

pub mod visit {
    //! Depth-first traversal with explicit prune/continue control.

    use crate::core::{NodeKind, NodeRef, Outline};

    /// What a visit method wants to happen next.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Walk<R> {
        /// Skip the children; `R` is the whole subtree's result.
        Prune(R),
        /// Visit the children and combine their results.
        Continue,
        /// Visit the children and combine `R` followed by their results.
        ContinueWith(R),
    }

    /// One method per node kind plus a combiner for child results.
    pub trait Visitor {
        type Output;

        fn visit_root(&mut self, _node: NodeRef<'_>) -> Walk<Self::Output> {
            Walk::Continue
        }

        fn visit_heading(&mut self, _node: NodeRef<'_>) -> Walk<Self::Output> {
            Walk::Continue
        }

        fn visit_text(&mut self, _node: NodeRef<'_>) -> Walk<Self::Output> {
            Walk::Continue
        }

        /// Merge per-child results into one. Called with an empty vec for leaves.
        fn combine(&mut self, results: Vec<Self::Output>) -> Self::Output;
    }

    /// Visit the whole outline pre-order, left to right.
    pub fn walk<V: Visitor + ?Sized>(outline: &Outline, visitor: &mut V) -> V::Output {
        walk_from(outline.root(), visitor)
    }

    /// Visit the subtree rooted at `node`.
    pub fn walk_from<V: Visitor + ?Sized>(node: NodeRef<'_>, visitor: &mut V) -> V::Output {
        let step = match node.kind() {
            NodeKind::Root => visitor.visit_root(node),
            NodeKind::Heading => visitor.visit_heading(node),
            NodeKind::Text => visitor.visit_text(node),
        };

        let mut results = match step {
            Walk::Prune(result) => return result,
            Walk::Continue => Vec::with_capacity(node.child_ids().len()),
            Walk::ContinueWith(own) => {
                let mut v = Vec::with_capacity(node.child_ids().len() + 1);
                v.push(own);
                v
            }
        };
        for child in node.children() {
            results.push(walk_from(child, visitor));
        }
        visitor.combine(results)
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::builder::{ParseOptions, parse_str};
        use crate::core::NodeId;

        struct Order(Vec<String>);

        impl Visitor for Order {
            type Output = ();

            fn visit_root(&mut self, _node: NodeRef<'_>) -> Walk<()> {
                self.0.push("root".into());
                Walk::Continue
            }
            fn visit_heading(&mut self, node: NodeRef<'_>) -> Walk<()> {
                self.0.push(node.text().to_string());
                Walk::Continue
            }
            fn visit_text(&mut self, node: NodeRef<'_>) -> Walk<()> {
                self.0.push(format!("text:{}", node.text()));
                Walk::Continue
            }
            fn combine(&mut self, _results: Vec<()>) {}
        }

        /// First heading whose title contains a needle; `combine` keeps the first hit.
        struct FirstContaining(&'static str);

        impl Visitor for FirstContaining {
            type Output = Option<NodeId>;

            fn visit_heading(&mut self, node: NodeRef<'_>) -> Walk<Self::Output> {
                if node.text().contains(self.0) {
                    Walk::Prune(Some(node.id()))
                } else {
                    Walk::Continue
                }
            }
            fn combine(&mut self, results: Vec<Self::Output>) -> Self::Output {
                results.into_iter().flatten().next()
            }
        }

        fn outline() -> Outline {
            parse_str(
                "* A\nnote a\n** B\n*** C\n** D\n* E",
                &ParseOptions::default(),
            )
            .unwrap()
        }

        #[test]
        fn visits_pre_order_left_to_right() {
            let mut v = Order(vec![]);
            walk(&outline(), &mut v);
            assert_eq!(v.0, ["root", "A", "text:note a", "B", "C", "D", "E"]);
        }

        #[test]
        fn prune_stops_descent() {
            struct SkipB(Vec<String>);
            impl Visitor for SkipB {
                type Output = usize;
                fn visit_heading(&mut self, node: NodeRef<'_>) -> Walk<usize> {
                    self.0.push(node.text().to_string());
                    if node.text() == "B" {
                        Walk::Prune(0)
                    } else {
                        Walk::ContinueWith(1)
                    }
                }
                fn combine(&mut self, results: Vec<usize>) -> usize {
                    results.into_iter().sum()
                }
            }

            let mut v = SkipB(vec![]);
            let counted = walk(&outline(), &mut v);
            assert_eq!(v.0, ["A", "B", "D", "E"]);
            assert_eq!(counted, 3);
        }

        #[test]
        fn combine_can_pick_the_first_result() {
            let o = outline();
            let hit = walk(&o, &mut FirstContaining("D")).unwrap();
            assert_eq!(o.get(hit).unwrap().text(), "D");
            assert_eq!(walk(&o, &mut FirstContaining("zzz")), None);
        }

        #[test]
        fn walk_from_covers_only_the_subtree() {
            let o = outline();
            let a = o.root().children().next().unwrap();
            let mut v = Order(vec![]);
            walk_from(a.last_child().unwrap(), &mut v);
            assert_eq!(v.0, ["D"]);
        }
    }
}

pub mod projectors {
    pub mod tagged {
        //! "Which headings carry tag X" without descending below a hit.

        use crate::core::{NodeId, NodeRef, Outline};
        use crate::visit::{Visitor, Walk, walk};

        pub struct TaggedHeadings<'t> {
            pub tag: &'t str,
        }

        impl Visitor for TaggedHeadings<'_> {
            type Output = Vec<NodeId>;

            fn visit_heading(&mut self, node: NodeRef<'_>) -> Walk<Self::Output> {
                if node.has_tag(self.tag) {
                    Walk::Prune(vec![node.id()])
                } else {
                    Walk::Continue
                }
            }

            fn visit_text(&mut self, _node: NodeRef<'_>) -> Walk<Self::Output> {
                Walk::Prune(vec![])
            }

            fn combine(&mut self, results: Vec<Self::Output>) -> Self::Output {
                results.into_iter().flatten().collect()
            }
        }

        /// Outermost headings tagged `tag`, in document order.
        pub fn find_tagged(outline: &Outline, tag: &str) -> Vec<NodeId> {
            walk(outline, &mut TaggedHeadings { tag })
        }

        #[cfg(test)]
        mod tests {
            use super::*;
            use crate::builder::{ParseOptions, parse_str};

            #[test]
            fn stops_at_first_tagged_ancestor() {
                let outline = parse_str(
                    "* Inbox\n** Project A :sync:\n*** Task :sync:\n** Loose\n*** Project B :sync:\n* Project C :sync:",
                    &ParseOptions::default(),
                )
                .unwrap();

                let titles: Vec<_> = find_tagged(&outline, "sync")
                    .into_iter()
                    .map(|id| outline.get(id).unwrap().text())
                    .collect();
                assert_eq!(titles, ["Project A", "Project B", "Project C"]);
                assert!(find_tagged(&outline, "absent").is_empty());
            }
        }
    }

    pub mod agenda {
        //! Agenda read model: one item per planning timestamp on a heading.

        use crate::core::{NodeId, NodeRef, Outline, PlanningKey, Status, Tag};
        use crate::visit::{Visitor, Walk, walk};
        use chrono::{NaiveDate, NaiveDateTime};
        use serde::{Deserialize, Serialize};

        #[serde_with::skip_serializing_none]
        #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
        pub struct AgendaItem {
            pub heading: NodeId,
            pub when_kind: PlanningKey,
            pub start: NaiveDateTime,
            pub end: Option<NaiveDateTime>,
            pub active: bool,
            pub title: String,
            pub status: Status,
            pub tags: Vec<Tag>,
            /// Titles of enclosing headings, outermost first.
            pub context_path: Vec<String>,
        }

        /// Inclusive date window.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        pub struct AgendaRange {
            pub from: Option<NaiveDate>,
            pub to: Option<NaiveDate>,
        }

        impl AgendaRange {
            pub fn contains(&self, dt: NaiveDateTime) -> bool {
                let date = dt.date();
                self.from.is_none_or(|f| date >= f) && self.to.is_none_or(|t| date <= t)
            }
        }

        struct AgendaCollector;

        impl Visitor for AgendaCollector {
            type Output = Vec<AgendaItem>;

            fn visit_heading(&mut self, node: NodeRef<'_>) -> Walk<Self::Output> {
                Walk::ContinueWith(items_for(node))
            }

            fn visit_text(&mut self, _node: NodeRef<'_>) -> Walk<Self::Output> {
                Walk::Prune(vec![])
            }

            fn combine(&mut self, results: Vec<Self::Output>) -> Self::Output {
                results.into_iter().flatten().collect()
            }
        }

        fn items_for(node: NodeRef<'_>) -> Vec<AgendaItem> {
            let attrs = node.attrs();
            if attrs.planning().next().is_none() {
                return vec![];
            }

            let mut context_path: Vec<String> = node
                .ancestors()
                .filter(|a| a.as_heading().is_some())
                .map(|a| a.text().to_string())
                .collect();
            context_path.reverse();

            attrs
                .planning()
                .map(|(kind, ts)| AgendaItem {
                    heading: node.id(),
                    when_kind: kind,
                    start: ts.start(),
                    end: ts.end(),
                    active: ts.active,
                    title: node.text().to_string(),
                    status: attrs.status,
                    tags: attrs.tags.iter().cloned().collect(),
                    context_path: context_path.clone(),
                })
                .collect()
        }

        /// Agenda items in document order.
        pub fn project(outline: &Outline) -> Vec<AgendaItem> {
            walk(outline, &mut AgendaCollector)
        }

        /// Items from many outlines inside `range`, sorted by start.
        pub fn project_all<'a>(
            outlines: impl IntoIterator<Item = &'a Outline>,
            range: AgendaRange,
        ) -> Vec<AgendaItem> {
            let mut items: Vec<AgendaItem> = outlines
                .into_iter()
                .flat_map(project)
                .filter(|item| range.contains(item.start))
                .collect();
            items.sort_by_key(|item| item.start);
            items
        }

    }
}

pub mod format {
    //! Text renderers: the indented debug dump and canonical org output.

    use crate::core::{NodeKind, NodeRef, Outline, PlanningKey, Timestamp};
    use crate::lexer::is_annotation_line;
    use crate::visit::{Visitor, Walk, walk};
    use std::fmt::Write;

    struct PrettyPrinter;

    impl PrettyPrinter {
        fn line(node: NodeRef<'_>) -> String {
            let attrs =
                serde_json::to_string(node.attrs()).unwrap_or_else(|_| String::from("{}"));
            format!(
                "{:indent$} #{} {} {}\n",
                "",
                node.kind().as_str(),
                node.text(),
                attrs,
                indent = node.level() * 2
            )
        }
    }

    impl Visitor for PrettyPrinter {
        type Output = String;

        fn visit_root(&mut self, node: NodeRef<'_>) -> Walk<String> {
            Walk::ContinueWith(Self::line(node))
        }

        fn visit_heading(&mut self, node: NodeRef<'_>) -> Walk<String> {
            Walk::ContinueWith(Self::line(node))
        }

        fn visit_text(&mut self, node: NodeRef<'_>) -> Walk<String> {
            Walk::Prune(Self::line(node))
        }

        fn combine(&mut self, results: Vec<String>) -> String {
            results.concat()
        }
    }

    /// One line per node, pre-order: `<indent> #<kind> <text> <json-attrs>`.
    pub fn pretty_print(outline: &Outline) -> String {
        walk(outline, &mut PrettyPrinter)
    }

    /// Render the outline back to org markup.
    pub fn format_outline(outline: &Outline) -> String {
        let mut out = String::new();
        for child in outline.root().children() {
            format_heading(&mut out, child);
        }
        out
    }

    /// Writes a heading and its body so each paragraph re-lexes on its own.
    ///
    /// A plain body line after anything but a headline or a standalone planning
    /// line joins the previous paragraph, so `at_break` tracks whether the next
    /// line starts a fresh one. `CLOSED` is not standalone: it must be preceded
    /// by a break and followed by one, or the text after it is swallowed.
    fn format_heading(out: &mut String, node: NodeRef<'_>) {
        out.push_str(&render_headline(node));
        out.push('\n');
        let mut at_break = true;

        let attrs = node.attrs();
        let standalone: Vec<String> = [PlanningKey::Deadline, PlanningKey::Scheduled]
            .into_iter()
            .filter_map(|key| key.get(attrs).map(|ts| render_planning(key, ts)))
            .collect();
        let mut closed = attrs
            .closed
            .as_ref()
            .map(|ts| render_planning(PlanningKey::Closed, ts));

        let texts: Vec<&str> = node
            .children()
            .filter(|c| c.kind() == NodeKind::Text)
            .map(|c| c.text())
            .collect();

        let body_breaks = texts.first().is_none_or(|t| opens_paragraph(t));
        if !standalone.is_empty() || body_breaks {
            if let Some(line) = closed.take() {
                push_line(out, &line);
                at_break = false;
            }
        }
        for line in &standalone {
            push_line(out, line);
            at_break = true;
        }

        for (idx, text) in texts.iter().enumerate() {
            if !at_break && !opens_paragraph(text) {
                if let Some(sep) = standalone.first() {
                    push_line(out, sep);
                }
            }
            push_line(out, text);
            at_break = closes_paragraph(text);

            let next_breaks = texts.get(idx + 1).is_none_or(|t| opens_paragraph(t));
            if at_break && next_breaks {
                if let Some(line) = closed.take() {
                    push_line(out, &line);
                    at_break = false;
                }
            }
        }
        if let Some(line) = closed {
            push_line(out, &line);
        }

        for child in node.children().filter(|c| c.kind() == NodeKind::Heading) {
            format_heading(out, child);
        }
    }

    fn push_line(out: &mut String, line: &str) {
        out.push_str(line);
        out.push('\n');
    }

    fn opens_paragraph(text: &str) -> bool {
        text.lines().next().is_some_and(is_annotation_line)
    }

    fn closes_paragraph(text: &str) -> bool {
        text.lines().last().is_some_and(is_annotation_line)
    }

    fn render_planning(key: PlanningKey, ts: &Timestamp) -> String {
        format!("{}: {}", key.keyword(), render_timestamp(ts))
    }

    fn render_headline(node: NodeRef<'_>) -> String {
        let attrs = node.attrs();
        let mut s = "*".repeat(node.depth());
        s.push(' ');
        if let Some(kw) = attrs.status.keyword() {
            s.push_str(kw);
            s.push(' ');
        }
        s.push_str(node.text());
        if !attrs.tags.is_empty() {
            if !node.text().is_empty() {
                s.push(' ');
            }
            s.push(':');
            for tag in &attrs.tags {
                s.push_str(tag.as_str());
                s.push(':');
            }
        }
        s
    }

    fn render_timestamp(ts: &Timestamp) -> String {
        let (open, close) = if ts.active { ('<', '>') } else { ('[', ']') };
        let mut s = String::new();
        s.push(open);
        let _ = write!(s, "{}", ts.date.format("%Y-%m-%d %a"));
        if let Some(t) = ts.time {
            let _ = write!(s, " {}", t.format("%H:%M"));
            if let Some(end) = ts.end_time {
                let _ = write!(s, "-{}", end.format("%H:%M"));
            }
        }
        s.push(close);
        s
    }

}

pub mod storage {
    use super::core::Outline;
    use anyhow::Result;
    use std::path::Path;

    /// Parsing seam for callers that work with files rather than strings.
    pub trait OutlineParser {
        fn parse_file(&self, path: &Path) -> Result<Outline>;
    }
}

pub mod config {
    //! Settings file (JSON). Unknown keys are ignored so settings shared with
    //! sync tooling still load.

    use crate::builder::{OrphanText, ParseOptions};
    use anyhow::{Context, Result};
    use serde::{Deserialize, Serialize};
    use std::{fs, path::Path};

    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct Settings {
        /// Policy for body text before the first heading.
        pub orphan_text: OrphanText,
        /// Tag used by `tagged` when none is given on the command line.
        pub sync_tag: Option<String>,
    }

    impl Settings {
        pub fn load(path: &Path) -> Result<Self> {
            let text = fs::read_to_string(path)
                .with_context(|| format!("reading settings {:?}", path))?;
            Self::from_json(&text).with_context(|| format!("parsing settings {:?}", path))
        }

        pub fn from_json(text: &str) -> Result<Self> {
            Ok(serde_json::from_str(text)?)
        }

        pub fn parse_options(&self) -> ParseOptions {
            ParseOptions {
                orphan_text: self.orphan_text,
            }
        }
    }

}

pub use builder::{NomOutlineParser, OrphanText, ParseOptions, build_tree, parse_str};
pub use crate::core::{Attrs, NodeId, NodeKind, NodeRef, Outline, ParseError, Status, Tag, Timestamp};
pub use format::{format_outline, pretty_print};
pub use visit::{Visitor, Walk, walk};
