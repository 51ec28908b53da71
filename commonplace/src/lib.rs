//! Moment/todo markup engine.
//! The library keeps the core pure: text goes in, an owned document tree comes out, and concrete
//! calendar instances are computed from that tree without touching the filesystem.
//!
//! Diagnostics are `tracing` events (`debug!` for dropped input, `trace!` for accepted nodes and
//! recurrence steps, `warn!` for stalled recurrences). The library installs no subscriber.

pub mod core {
    use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime};
    use serde::{Deserialize, Serialize};
    use std::sync::Arc;

    /* ----------------------------- Positions ----------------------------- */

    /// Exact provenance of a token in the source text.
    ///
    /// Offsets and lengths are byte offsets into the UTF-8 source, so
    /// `&source[offset..offset + length]` is always the literal token text.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct DocPosition {
        /// 0-based line number.
        pub line_num: usize,
        pub offset: usize,
        pub length: usize,
    }

    impl DocPosition {
        pub fn new(line_num: usize, offset: usize, length: usize) -> Self {
            Self {
                line_num,
                offset,
                length,
            }
        }

        pub fn end(&self) -> usize {
            self.offset + self.length
        }

        /// The token text this position points at, if it lies inside `source`.
        pub fn slice<'a>(&self, source: &'a str) -> Option<&'a str> {
            source.get(self.offset..self.end())
        }
    }

    /* ------------------------------ Entities ------------------------------ */

    /// A named grouping header preceding a run of top-level moments.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Category {
        pub name: String,
        /// Trailing `[color]` of the name line.
        pub color: Option<String>,
        pub priority: u32,
        /// Spans the full name line.
        pub doc_pos: DocPosition,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum WorkState {
        #[default]
        New,
        Waiting,
        InProgress,
        Done,
    }

    impl WorkState {
        pub fn is_done(self) -> bool {
            matches!(self, WorkState::Done)
        }
    }

    /// A resolved date (or date and time) with the position of the token it was read from.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct MomentDateTime {
        pub dt: NaiveDateTime,
        pub doc_pos: DocPosition,
    }

    /// Time-of-day token, e.g. `13:15` in `(21.06.2016 13:15)`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct MomentTime {
        pub time: NaiveTime,
        pub doc_pos: DocPosition,
    }

    /// A free-text line attached to the nearest enclosing moment.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Comment {
        pub content: String,
        pub doc_pos: DocPosition,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum RecurrenceType {
        Daily,
        Weekly,
        BiWeekly,
        TriWeekly,
        QuadriWeekly,
        Monthly,
        Yearly,
    }

    impl RecurrenceType {
        /// Length of the week cycle for the n-weekly variants.
        pub fn week_cycle(self) -> Option<i64> {
            match self {
                RecurrenceType::BiWeekly => Some(2),
                RecurrenceType::TriWeekly => Some(3),
                RecurrenceType::QuadriWeekly => Some(4),
                RecurrenceType::Daily
                | RecurrenceType::Weekly
                | RecurrenceType::Monthly
                | RecurrenceType::Yearly => None,
            }
        }
    }

    /// A repeating schedule. `ref_date` anchors the phase (weekday, day of month, month and day)
    /// but is not an occurrence by itself.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Recurrence {
        pub recurrence_type: RecurrenceType,
        pub ref_date: MomentDateTime,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(tag = "type", rename_all = "snake_case")]
    pub enum MomentKind {
        Single {
            start: Option<MomentDateTime>,
            end: Option<MomentDateTime>,
        },
        Recurring {
            recurrence: Recurrence,
        },
    }

    /// A parsed todo node. Owns its comments and sub-moments; the category is shared.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Moment {
        pub name: String,
        #[serde(default)]
        pub comments: Vec<Comment>,
        #[serde(default)]
        pub sub_moments: Vec<Moment>,
        pub work_state: WorkState,
        pub priority: u32,
        pub category: Option<Arc<Category>>,
        pub time_of_day: Option<MomentTime>,
        /// Spans the whole source line of the moment.
        pub doc_pos: DocPosition,
        #[serde(flatten)]
        pub kind: MomentKind,
    }

    impl Moment {
        pub fn is_done(&self) -> bool {
            self.work_state.is_done()
        }

        pub fn start(&self) -> Option<&MomentDateTime> {
            match &self.kind {
                MomentKind::Single { start, .. } => start.as_ref(),
                MomentKind::Recurring { .. } => None,
            }
        }

        pub fn end(&self) -> Option<&MomentDateTime> {
            match &self.kind {
                MomentKind::Single { end, .. } => end.as_ref(),
                MomentKind::Recurring { .. } => None,
            }
        }

        pub fn recurrence(&self) -> Option<&Recurrence> {
            match &self.kind {
                MomentKind::Recurring { recurrence } => Some(recurrence),
                MomentKind::Single { .. } => None,
            }
        }
    }

    /// Result of one parse call.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct Todos {
        #[serde(default)]
        pub categories: Vec<Arc<Category>>,
        #[serde(default)]
        pub moments: Vec<Moment>,
    }

    /// A concrete occurrence of a moment inside a window.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Instance {
        pub name: String,
        pub start: NaiveDateTime,
        pub end: NaiveDateTime,
        /// The moment really ends inside this instance rather than being cut off by the window.
        pub ends_in_range: bool,
        pub time_of_day: Option<NaiveTime>,
        pub priority: u32,
        pub category: Option<Arc<Category>>,
        pub done: bool,
        pub work_state: WorkState,
        pub origin_doc_pos: DocPosition,
        #[serde(default)]
        pub sub_instances: Vec<Instance>,
    }

    /* ---------------------------- Configuration ---------------------------- */

    /// Grammar constants. Built once and passed by reference into every parse call.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct ParseConfig {
        pub category_delim: String,
        pub priority_mark: char,
        pub tab_size: usize,
        pub left_state_bracket: String,
        pub right_state_bracket: String,
        pub left_date_bracket: String,
        pub right_date_bracket: String,
        /// chrono `strftime` patterns, tried in order.
        pub date_formats: Vec<String>,
        pub time_format: String,
        pub done_mark: char,
        pub waiting_mark: char,
        pub in_progress_mark: char,
        /// Overrides "now" when anchoring new recurrences.
        pub fixed_time: Option<NaiveDateTime>,
    }

    impl Default for ParseConfig {
        fn default() -> Self {
            Self {
                category_delim: "------".to_string(),
                priority_mark: '!',
                tab_size: 4,
                left_state_bracket: "[".to_string(),
                right_state_bracket: "]".to_string(),
                left_date_bracket: "(".to_string(),
                right_date_bracket: ")".to_string(),
                date_formats: vec!["%d.%m.%y".to_string(), "%d.%m.%Y".to_string()],
                time_format: "%H:%M".to_string(),
                done_mark: 'x',
                waiting_mark: 'w',
                in_progress_mark: 'p',
                fixed_time: None,
            }
        }
    }

    impl ParseConfig {
        pub fn with_fixed_time(mut self, fixed_time: NaiveDateTime) -> Self {
            self.fixed_time = Some(fixed_time);
            self
        }

        pub fn now(&self) -> NaiveDateTime {
            self.fixed_time
                .unwrap_or_else(|| Local::now().naive_local())
        }

        /// Work state for the character found between the state brackets.
        pub fn work_state_for(&self, mark: Option<char>) -> WorkState {
            match mark {
                Some(c) if c == self.done_mark => WorkState::Done,
                Some(c) if c == self.waiting_mark => WorkState::Waiting,
                Some(c) if c == self.in_progress_mark => WorkState::InProgress,
                _ => WorkState::New,
            }
        }

        pub fn validate(&self) -> Result<(), ConfigError> {
            let required = [
                ("category_delim", &self.category_delim),
                ("left_state_bracket", &self.left_state_bracket),
                ("right_state_bracket", &self.right_state_bracket),
                ("left_date_bracket", &self.left_date_bracket),
                ("right_date_bracket", &self.right_date_bracket),
                ("time_format", &self.time_format),
            ];
            if let Some(&(field, _)) = required.iter().find(|(_, value)| value.is_empty()) {
                return Err(ConfigError::Empty { field });
            }
            if self.date_formats.iter().all(|f| f.is_empty()) {
                return Err(ConfigError::Empty {
                    field: "date_formats",
                });
            }
            if self.tab_size == 0 {
                return Err(ConfigError::ZeroTabSize);
            }

            let marks = [
                self.done_mark,
                self.waiting_mark,
                self.in_progress_mark,
                self.priority_mark,
            ];
            if let Some(&mark) = marks.iter().find(|c| c.is_whitespace()) {
                return Err(ConfigError::WhitespaceMark { mark });
            }
            for (idx, mark) in marks.iter().enumerate() {
                if marks[idx + 1..].contains(mark) {
                    return Err(ConfigError::DuplicateMark { mark: *mark });
                }
            }
            Ok(())
        }
    }

    /* ------------------------------- Dates ------------------------------- */

    pub fn start_of_day(date: NaiveDate) -> NaiveDateTime {
        date.and_hms_opt(0, 0, 0).expect("midnight is a valid time")
    }

    pub fn end_of_day(date: NaiveDate) -> NaiveDateTime {
        date.and_hms_micro_opt(23, 59, 59, 999_999)
            .expect("last microsecond of the day is a valid time")
    }

    /* ------------------------------- Errors ------------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum ConfigError {
        #[error("`{field}` must not be empty")]
        Empty { field: &'static str },
        #[error("tab size must be at least 1")]
        ZeroTabSize,
        #[error("mark {mark:?} must not be whitespace")]
        WhitespaceMark { mark: char },
        #[error("mark {mark:?} is configured for more than one purpose")]
        DuplicateMark { mark: char },
    }

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum RecurrenceError {
        #[error("{recurrence_type:?} recurrence did not advance past {after} (got {next})")]
        Stalled {
            recurrence_type: RecurrenceType,
            after: NaiveDate,
            next: NaiveDate,
        },
        #[error("{recurrence_type:?} recurrence left the supported date range after {after}")]
        OutOfRange {
            recurrence_type: RecurrenceType,
            after: NaiveDate,
        },
    }

}

pub mod lines {
    //! Single-pass line cursor with one slot of pushback.

    /// One source line. `content` has the line terminator (`\n` or `\r\n`) removed;
    /// `raw_len` is the untranslated byte length including the terminator.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Line<'a> {
        pub content: &'a str,
        pub line_num: usize,
        pub offset: usize,
        pub raw_len: usize,
    }

    impl Line<'_> {
        /// Byte offset of the first byte after this line, terminator included.
        pub fn end_offset(&self) -> usize {
            self.offset + self.raw_len
        }

        pub fn is_blank(&self) -> bool {
            self.content.trim().is_empty()
        }
    }

    #[derive(Debug, Clone)]
    pub struct LineSource<'a> {
        rest: &'a str,
        line_num: usize,
        offset: usize,
        last: Option<Line<'a>>,
        last_terminated: bool,
        tail_emitted: bool,
        pending: bool,
    }

    impl<'a> LineSource<'a> {
        pub fn new(source: &'a str) -> Self {
            Self {
                rest: source,
                line_num: 0,
                offset: 0,
                last: None,
                last_terminated: false,
                tail_emitted: false,
                pending: false,
            }
        }

        /// Re-deliver the most recently returned line on the next call to `next`.
        /// Only one line is retained: calling this again before `next` changes nothing,
        /// and calling it before any line was read is a no-op.
        pub fn pushback(&mut self) {
            if self.last.is_some() {
                self.pending = true;
            }
        }

        fn emit(&mut self, line: Line<'a>) -> Line<'a> {
            self.line_num = line.line_num + 1;
            self.offset = line.end_offset();
            self.last = Some(line);
            line
        }
    }

    impl<'a> Iterator for LineSource<'a> {
        type Item = Line<'a>;

        fn next(&mut self) -> Option<Line<'a>> {
            if self.pending {
                self.pending = false;
                return self.last;
            }

            if self.rest.is_empty() {
                // A terminated final line is followed by an empty one, so the position
                // right after it stays addressable.
                if self.last_terminated && !self.tail_emitted {
                    self.tail_emitted = true;
                    let tail = Line {
                        content: "",
                        line_num: self.line_num,
                        offset: self.offset,
                        raw_len: 0,
                    };
                    return Some(self.emit(tail));
                }
                return None;
            }

            let (raw, rest) = match self.rest.find('\n') {
                Some(idx) => self.rest.split_at(idx + 1),
                None => (self.rest, ""),
            };
            self.rest = rest;
            self.last_terminated = raw.ends_with('\n');

            let content = match raw.strip_suffix('\n') {
                Some(stripped) => stripped.strip_suffix('\r').unwrap_or(stripped),
                None => raw,
            };
            let line = Line {
                content,
                line_num: self.line_num,
                offset: self.offset,
                raw_len: raw.len(),
            };
            Some(self.emit(line))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use pretty_assertions::assert_eq;

        fn collect(source: &str) -> Vec<(&str, usize, usize)> {
            LineSource::new(source)
                .map(|l| (l.content, l.line_num, l.offset))
                .collect()
        }

        #[test]
        fn splits_lines_and_tracks_offsets() {
            assert_eq!(
                collect("a\nbb\nccc"),
                vec![("a", 0, 0), ("bb", 1, 2), ("ccc", 2, 5)]
            );
        }

        #[test]
        fn terminated_input_yields_trailing_empty_line() {
            assert_eq!(
                collect("a\nbb\n"),
                vec![("a", 0, 0), ("bb", 1, 2), ("", 2, 5)]
            );
        }

        #[test]
        fn empty_input_yields_nothing() {
            assert!(collect("").is_empty());
        }

        #[test]
        fn crlf_offsets_count_the_carriage_return() {
            let lines: Vec<_> = LineSource::new("ab\r\ncd\r\n").collect();
            assert_eq!(lines[0].content, "ab");
            assert_eq!(lines[0].raw_len, 4);
            assert_eq!(lines[1].content, "cd");
            assert_eq!(lines[1].offset, 4);
            assert_eq!(lines[2].offset, 8);
            assert_eq!(lines.len(), 3);
        }

        #[test]
        fn pushback_redelivers_last_line_once() {
            let mut src = LineSource::new("one\ntwo\nthree");
            assert_eq!(src.next().map(|l| l.content), Some("one"));
            assert_eq!(src.next().map(|l| l.content), Some("two"));
            src.pushback();
            src.pushback();
            let again = src.next().expect("pushed back line");
            assert_eq!((again.content, again.line_num, again.offset), ("two", 1, 4));
            assert_eq!(src.next().map(|l| l.content), Some("three"));
            assert_eq!(src.next(), None);
        }

        #[test]
        fn pushback_of_last_line_then_end() {
            let mut src = LineSource::new("only");
            let first = src.next().expect("line");
            src.pushback();
            assert_eq!(src.next(), Some(first));
            assert_eq!(src.next(), None);
        }

        #[test]
        fn pushback_before_reading_is_ignored() {
            let mut src = LineSource::new("x");
            src.pushback();
            assert_eq!(src.next().map(|l| l.content), Some("x"));
            assert_eq!(src.next(), None);
        }

        #[test]
        fn pushback_of_trailing_empty_line() {
            let mut src = LineSource::new("x\n");
            src.next();
            let tail = src.next().expect("tail line");
            src.pushback();
            assert_eq!(src.next(), Some(tail));
            assert_eq!(src.next(), None);
        }
    }
}

pub mod grammar {
    //! Lexical rules of category and moment lines.
    //!
    //! Every rule takes a sub-slice of a source line and hands back sub-slices of it, so the
    //! caller can turn any returned text into an exact document position with `nom::Offset`.

    use crate::core::*;
    use chrono::{NaiveDate, NaiveTime, Weekday};
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{tag, tag_no_case, take_while_m_n},
        character::complete::{char, multispace0, one_of, space1},
        combinator::{all_consuming, map, map_res, opt, recognize, value},
        error::VerboseError,
        sequence::{delimited, preceded, separated_pair, terminated, tuple},
    };

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /// A recognized value together with the exact text it was read from.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Token<'a, T> {
        pub value: T,
        pub text: &'a str,
    }

    /* ----------------------------- State mark ----------------------------- */

    /// `[ x ]`-style mark at the start of `input`. Returns the work state and the trimmed rest.
    /// Anything other than optional whitespace around at most one known mark is rejected.
    pub fn state_mark<'a>(input: &'a str, config: &ParseConfig) -> Option<(WorkState, &'a str)> {
        let marks: String = [config.done_mark, config.waiting_mark, config.in_progress_mark]
            .iter()
            .collect();
        let mut rule = tuple((
            tag(config.left_state_bracket.as_str()),
            multispace0,
            opt(one_of(marks.as_str())),
            multispace0,
            tag(config.right_state_bracket.as_str()),
        ));
        let parsed: PResult<'a, _> = rule(input);
        let (rest, (_, _, mark, _, _)) = parsed.ok()?;
        Some((config.work_state_for(mark), rest.trim()))
    }

    /* --------------------------- Name decorations --------------------------- */

    /// Counts the trailing run of `mark` characters. Returns the count and the trimmed remainder.
    pub fn priority_suffix(text: &str, mark: char) -> (u32, &str) {
        let stripped = text.trim_end_matches(mark);
        let count = text[stripped.len()..].chars().count();
        (u32::try_from(count).unwrap_or(u32::MAX), stripped.trim())
    }

    /// Trailing `[color]` of a category name line: from the first `[` up to a final `]`.
    pub fn category_color(text: &str) -> (Option<&str>, &str) {
        match text.find('[') {
            Some(start) if text.ends_with(']') => {
                (Some(&text[start + 1..text.len() - 1]), text[..start].trim())
            }
            _ => (None, text),
        }
    }

    /* ---------------------------- Dates & times ---------------------------- */

    /// A whitespace-separated time token at the end of `text`, e.g. `13:15` in `every day 13:15`.
    pub fn time_suffix<'a>(
        text: &'a str,
        config: &ParseConfig,
    ) -> Option<(Token<'a, NaiveTime>, &'a str)> {
        let (head, time_text) = text.trim().rsplit_once(char::is_whitespace)?;
        if time_text.is_empty() {
            return None;
        }
        let value = NaiveTime::parse_from_str(time_text, &config.time_format).ok()?;
        Some((
            Token {
                value,
                text: time_text,
            },
            head,
        ))
    }

    pub fn date(text: &str, config: &ParseConfig) -> Option<NaiveDate> {
        let text = text.trim();
        config
            .date_formats
            .iter()
            .filter(|fmt| !fmt.is_empty())
            .find_map(|fmt| NaiveDate::parse_from_str(text, fmt).ok())
    }

    fn date_token<'a>(text: &'a str, config: &ParseConfig) -> Option<Token<'a, NaiveDate>> {
        let text = text.trim();
        date(text, config).map(|value| Token { value, text })
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DateRange<'a> {
        pub start: Option<Token<'a, NaiveDate>>,
        pub end: Option<Token<'a, NaiveDate>>,
    }

    /// One date, or two dates separated by `-`. Each dash is tried in turn so date formats that
    /// contain dashes still split correctly; one side of the split may be left empty for an
    /// open-ended range. A single date yields `end == start`, pointing at the same text.
    pub fn date_range<'a>(text: &'a str, config: &ParseConfig) -> Option<DateRange<'a>> {
        let text = text.trim();
        for (dash, _) in text.match_indices('-') {
            if let Some(range) = split_range(&text[..dash], &text[dash + 1..], config) {
                return Some(range);
            }
        }

        let single = date_token(text, config)?;
        Some(DateRange {
            start: Some(single),
            end: Some(single),
        })
    }

    fn split_range<'a>(left: &'a str, right: &'a str, config: &ParseConfig) -> Option<DateRange<'a>> {
        let start = match left.trim() {
            "" => None,
            side => Some(date_token(side, config)?),
        };
        let end = match right.trim() {
            "" => None,
            side => Some(date_token(side, config)?),
        };
        if start.is_none() && end.is_none() {
            return None;
        }
        Some(DateRange { start, end })
    }

    /* ---------------------------- Recurrences ---------------------------- */

    /// A recognized recurrence phrase, before it is anchored to a reference date.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum RecurrenceRule {
        Daily,
        Weekly(Weekday),
        NWeekly(RecurrenceType, Weekday),
        Monthly { day: u32 },
        Yearly { day: u32, month: u32 },
    }

    /// Finds a recurrence phrase in `text`, first match wins: `every day`/`today`,
    /// `every <weekday>` and `every 2nd|3rd|4th <weekday>` anywhere in the text, then `every D.`
    /// and `every D.M.` (trailing dot optional) only where they end the text.
    pub fn recurrence_rule(text: &str) -> Option<RecurrenceRule> {
        let text = text.trim();
        search(text, daily)
            .or_else(|| search(text, weekly))
            .or_else(|| search(text, n_weekly))
            .or_else(|| search(text, all_consuming(monthly)))
            .or_else(|| search(text, all_consuming(yearly)))
    }

    /// First successful match of `rule` starting at any character of `text`.
    fn search<'a, O>(text: &'a str, mut rule: impl FnMut(&'a str) -> PResult<'a, O>) -> Option<O> {
        text.char_indices()
            .find_map(|(idx, _)| rule(&text[idx..]).ok().map(|(_, found)| found))
    }

    fn every(i: &str) -> PResult<'_, &str> {
        terminated(tag_no_case("every"), space1)(i)
    }

    fn daily(i: &str) -> PResult<'_, RecurrenceRule> {
        value(
            RecurrenceRule::Daily,
            alt((
                recognize(tuple((tag_no_case("every"), space1, tag_no_case("day")))),
                tag_no_case("today"),
            )),
        )(i)
    }

    fn weekday(i: &str) -> PResult<'_, Weekday> {
        alt((
            value(Weekday::Mon, tag_no_case("monday")),
            value(Weekday::Tue, tag_no_case("tuesday")),
            value(Weekday::Wed, tag_no_case("wednesday")),
            value(Weekday::Thu, tag_no_case("thursday")),
            value(Weekday::Fri, tag_no_case("friday")),
            value(Weekday::Sat, tag_no_case("saturday")),
            value(Weekday::Sun, tag_no_case("sunday")),
        ))(i)
    }

    fn weekly(i: &str) -> PResult<'_, RecurrenceRule> {
        map(preceded(every, weekday), RecurrenceRule::Weekly)(i)
    }

    fn nth(i: &str) -> PResult<'_, RecurrenceType> {
        alt((
            value(RecurrenceType::BiWeekly, tag_no_case("2nd")),
            value(RecurrenceType::TriWeekly, tag_no_case("3rd")),
            value(RecurrenceType::QuadriWeekly, tag_no_case("4th")),
        ))(i)
    }

    fn n_weekly(i: &str) -> PResult<'_, RecurrenceRule> {
        map(
            preceded(every, separated_pair(nth, space1, weekday)),
            |(recurrence_type, day)| RecurrenceRule::NWeekly(recurrence_type, day),
        )(i)
    }

    fn day_number(i: &str) -> PResult<'_, u32> {
        map_res(take_while_m_n(1, 2, |c: char| c.is_ascii_digit()), str::parse)(i)
    }

    fn monthly(i: &str) -> PResult<'_, RecurrenceRule> {
        map(delimited(every, day_number, opt(char('.'))), |day| {
            RecurrenceRule::Monthly { day }
        })(i)
    }

    fn yearly(i: &str) -> PResult<'_, RecurrenceRule> {
        map(
            delimited(
                every,
                separated_pair(day_number, char('.'), day_number),
                opt(char('.')),
            ),
            |(day, month)| RecurrenceRule::Yearly { day, month },
        )(i)
    }

}

pub mod recurrence {
    //! Date arithmetic for recurring moments. Works on calendar dates only; the time of day of an
    //! occurrence is decided by whoever turns it into an instance.

    use crate::core::*;
    use crate::grammar::RecurrenceRule;
    use chrono::{Datelike, Days, NaiveDate, Weekday};
    use tracing::{trace, warn};

    const SECONDS_PER_WEEK: i64 = 604_800;

    /// Whole weeks between 1970-01-01 (UTC) and the start of `date`.
    pub fn epoch_week(date: NaiveDate) -> i64 {
        start_of_day(date)
            .and_utc()
            .timestamp()
            .div_euclid(SECONDS_PER_WEEK)
    }

    /// First date strictly after `after` on which `recurrence` occurs.
    pub fn next_occurrence(
        recurrence: &Recurrence,
        after: NaiveDate,
    ) -> Result<NaiveDate, RecurrenceError> {
        let recurrence_type = recurrence.recurrence_type;
        let ref_date = recurrence.ref_date.dt.date();
        let next = match recurrence_type {
            RecurrenceType::Daily => after.succ_opt(),
            RecurrenceType::Weekly => next_weekday(after, ref_date.weekday()),
            RecurrenceType::BiWeekly => next_n_weekly(after, ref_date, 2),
            RecurrenceType::TriWeekly => next_n_weekly(after, ref_date, 3),
            RecurrenceType::QuadriWeekly => next_n_weekly(after, ref_date, 4),
            RecurrenceType::Monthly => next_monthly(after, ref_date.day()),
            RecurrenceType::Yearly => next_yearly(after, ref_date),
        }
        .ok_or(RecurrenceError::OutOfRange {
            recurrence_type,
            after,
        })?;

        if next <= after {
            warn!(?recurrence_type, %after, %next, "recurrence did not advance");
            return Err(RecurrenceError::Stalled {
                recurrence_type,
                after,
                next,
            });
        }
        trace!(?recurrence_type, %after, %next, "next occurrence");
        Ok(next)
    }

    fn next_weekday(after: NaiveDate, weekday: Weekday) -> Option<NaiveDate> {
        let ahead =
            (7 + weekday.num_days_from_monday() - after.weekday().num_days_from_monday()) % 7;
        let ahead = if ahead == 0 { 7 } else { ahead };
        after.checked_add_days(Days::new(u64::from(ahead)))
    }

    fn next_n_weekly(after: NaiveDate, ref_date: NaiveDate, cycle: i64) -> Option<NaiveDate> {
        let date = next_weekday(after, ref_date.weekday())?;
        let offset = (epoch_week(date) - epoch_week(ref_date)).rem_euclid(cycle);
        if offset == 0 {
            return Some(date);
        }
        let shift = u64::try_from(7 * (cycle - offset)).ok()?;
        date.checked_add_days(Days::new(shift))
    }

    fn next_monthly(after: NaiveDate, day: u32) -> Option<NaiveDate> {
        let candidate = clamped_date(after.year(), after.month(), day)?;
        if candidate > after {
            return Some(candidate);
        }
        let (year, month) = month_after(after.year(), after.month());
        clamped_date(year, month, day)
    }

    /// First date after `after` carrying the reference day and month.
    ///
    /// Provisional: a Feb 29 reference falls on Feb 28 in common years and returns to Feb 29
    /// in leap years. No leap-year policy has been settled for these dates yet; revisit this
    /// clamping once one is.
    fn next_yearly(after: NaiveDate, ref_date: NaiveDate) -> Option<NaiveDate> {
        let candidate = clamped_date(after.year(), ref_date.month(), ref_date.day())?;
        if candidate > after {
            return Some(candidate);
        }
        clamped_date(after.year() + 1, ref_date.month(), ref_date.day())
    }

    fn month_after(year: i32, month: u32) -> (i32, u32) {
        if month == 12 {
            (year + 1, 1)
        } else {
            (year, month + 1)
        }
    }

    pub fn days_in_month(year: i32, month: u32) -> Option<u32> {
        let (next_year, next_month) = month_after(year, month);
        NaiveDate::from_ymd_opt(next_year, next_month, 1)?
            .pred_opt()
            .map(|last| last.day())
    }

    /// `day` in the given month, pulled back to the month's last day when it does not exist.
    fn clamped_date(year: i32, month: u32, day: u32) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(year, month, day.min(days_in_month(year, month)?))
    }

    /* ----------------------------- Generation ----------------------------- */

    /// Ascending occurrences in `[start, end]`. Stops after the first error.
    #[derive(Debug, Clone)]
    pub struct Occurrences {
        recurrence: Recurrence,
        cursor: Option<NaiveDate>,
        start: NaiveDate,
        end: NaiveDate,
        finished: bool,
    }

    impl Iterator for Occurrences {
        type Item = Result<NaiveDate, RecurrenceError>;

        fn next(&mut self) -> Option<Self::Item> {
            if self.finished {
                return None;
            }
            let Some(after) = self.cursor else {
                self.finished = true;
                return Some(Err(RecurrenceError::OutOfRange {
                    recurrence_type: self.recurrence.recurrence_type,
                    after: self.start,
                }));
            };

            match next_occurrence(&self.recurrence, after) {
                Ok(date) if date <= self.end => {
                    self.cursor = Some(date);
                    Some(Ok(date))
                }
                Ok(_) => {
                    self.finished = true;
                    None
                }
                Err(err) => {
                    self.finished = true;
                    Some(Err(err))
                }
            }
        }
    }

    pub fn generate_occurrences(
        recurrence: &Recurrence,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Occurrences {
        Occurrences {
            recurrence: *recurrence,
            cursor: start.pred_opt(),
            start,
            end,
            finished: false,
        }
    }

    /* ------------------------------ Anchoring ------------------------------ */

    /// Reference date for a freshly parsed rule, relative to `today`.
    ///
    /// Weekly rules pick the weekday in the Sunday-started week containing `today`; n-weekly rules
    /// then step back so the reference falls on an epoch week divisible by the cycle. Monthly and
    /// yearly rules move forward to the first month (or year) in which the day exists; rules naming
    /// an impossible day or month yield `None`.
    pub fn anchor(rule: RecurrenceRule, today: NaiveDate) -> Option<(RecurrenceType, NaiveDate)> {
        match rule {
            RecurrenceRule::Daily => Some((RecurrenceType::Daily, today)),
            RecurrenceRule::Weekly(weekday) => {
                Some((RecurrenceType::Weekly, weekday_in_week(today, weekday)?))
            }
            RecurrenceRule::NWeekly(recurrence_type, weekday) => {
                let cycle = recurrence_type.week_cycle()?;
                let date = weekday_in_week(today, weekday)?;
                let back = u64::try_from(7 * epoch_week(date).rem_euclid(cycle)).ok()?;
                Some((recurrence_type, date.checked_sub_days(Days::new(back))?))
            }
            RecurrenceRule::Monthly { day } => {
                if !(1..=31).contains(&day) {
                    return None;
                }
                std::iter::successors(Some((today.year(), today.month())), |&(year, month)| {
                    Some(month_after(year, month))
                })
                .take(12)
                .find_map(|(year, month)| NaiveDate::from_ymd_opt(year, month, day))
                .map(|date| (RecurrenceType::Monthly, date))
            }
            RecurrenceRule::Yearly { day, month } => {
                // Feb 29 can be up to eight years away.
                (today.year()..=today.year() + 8)
                    .find_map(|year| NaiveDate::from_ymd_opt(year, month, day))
                    .map(|date| (RecurrenceType::Yearly, date))
            }
        }
    }

    fn weekday_in_week(today: NaiveDate, weekday: Weekday) -> Option<NaiveDate> {
        let since_sunday = today.weekday().num_days_from_sunday();
        let sunday = today.checked_sub_days(Days::new(u64::from(since_sunday)))?;
        sunday.checked_add_days(Days::new(u64::from(weekday.num_days_from_sunday())))
    }

}

pub mod parser {
    //! Indentation-aware recursive descent over [`LineSource`].
    //!
    //! Parsing strategy:
    //! - The top-level scan is line-oriented: category blocks (delimiter, name, delimiter) and
    //!   moment lines; everything else is skipped.
    //! - A moment line is decomposed from the right: date or recurrence suffix, then the mandatory
    //!   state mark at the front, then the priority suffix of what is left.
    //! - Children of a moment are the following lines indented by at least one more tab stop.
    //!   The first line that is not is pushed back for an enclosing frame.
    //!
    //! Malformed input never fails the parse; the offending node is dropped.

    use crate::core::*;
    use crate::grammar::{self, Token};
    use crate::lines::{Line, LineSource};
    use crate::recurrence;
    use chrono::NaiveDate;
    use nom::Offset;
    use std::sync::Arc;
    use tracing::{debug, trace};

    /* ------------------------ Public entry points ------------------------ */

    pub fn parse_todos(source: &str, config: &ParseConfig) -> Todos {
        parse_todos_lines(LineSource::new(source), config)
    }

    pub fn parse_todos_lines(lines: LineSource<'_>, config: &ParseConfig) -> Todos {
        let mut parser = Parser {
            config,
            lines,
            today: config.now().date(),
            todos: Todos::default(),
        };
        parser.run();
        parser.todos
    }

    struct Parser<'s, 'c> {
        config: &'c ParseConfig,
        lines: LineSource<'s>,
        /// Anchor for recurrences parsed in this call.
        today: NaiveDate,
        todos: Todos,
    }

    /// Position of `token`, which must be a sub-slice of `line.content`.
    fn position(line: &Line<'_>, token: &str) -> DocPosition {
        DocPosition::new(
            line.line_num,
            line.offset + line.content.offset(token),
            token.len(),
        )
    }

    fn line_position(line: &Line<'_>) -> DocPosition {
        DocPosition::new(line.line_num, line.offset, line.content.trim_end().len())
    }

    /// Indentation width of `content` (tabs count `tab_size`, spaces 1) and the number of
    /// indentation bytes, stopping once `max_indent` is reached.
    fn indentation(content: &str, tab_size: usize, max_indent: usize) -> (usize, usize) {
        let mut width = 0;
        let mut count = 0;
        for c in content.chars() {
            match c {
                '\t' => width += tab_size,
                ' ' => width += 1,
                _ => break,
            }
            count += 1;
            if width >= max_indent {
                break;
            }
        }
        (width, count)
    }

    type Suffix<'s> = (MomentKind, Option<MomentTime>, &'s str);

    impl<'s> Parser<'s, '_> {
        fn run(&mut self) {
            while let Some(line) = self.lines.next() {
                if line.is_blank() {
                    continue;
                }
                if self.is_category_delim(&line) {
                    self.category_block(line);
                } else if line.content.starts_with(&self.config.left_state_bracket) {
                    match self.moment_block(line, line.content.trim(), 0) {
                        Some(moment) => self.todos.moments.push(moment),
                        None => debug!(line = line.line_num, "not a moment line, skipped"),
                    }
                }
            }
        }

        fn is_category_delim(&self, line: &Line<'_>) -> bool {
            line.content.starts_with(&self.config.category_delim)
        }

        /* ---------------------------- Categories ---------------------------- */

        fn category_block(&mut self, opening: Line<'s>) {
            let Some(name_line) = self.lines.next() else {
                debug!(line = opening.line_num, "category delimiter at end of input");
                return;
            };

            match self.lines.next() {
                Some(closing) if self.is_category_delim(&closing) => {}
                Some(_) => {
                    // The block is dropped together with the line read in place of the delimiter.
                    debug!(line = opening.line_num, "category block without closing delimiter");
                    return;
                }
                None => {
                    debug!(line = opening.line_num, "category block cut off by end of input");
                    return;
                }
            }

            let category = self.category(&name_line);
            trace!(name = %category.name, line = name_line.line_num, "category");
            self.todos.categories.push(Arc::new(category));
        }

        fn category(&self, line: &Line<'_>) -> Category {
            let (color, rest) = grammar::category_color(line.content.trim_end());
            let (priority, name) = grammar::priority_suffix(rest, self.config.priority_mark);
            Category {
                name: name.to_string(),
                color: color.map(str::to_string),
                priority,
                doc_pos: line_position(line),
            }
        }

        /* ------------------------------ Moments ------------------------------ */

        /// A moment and its children. `text` is the part of `line` after the indentation.
        fn moment_block(&mut self, line: Line<'s>, text: &'s str, indent: usize) -> Option<Moment> {
            let mut moment = self.moment_line(&line, text)?;
            moment.category = self.todos.categories.last().cloned();
            self.collect_children(&mut moment, indent);
            Some(moment)
        }

        fn moment_line(&self, line: &Line<'s>, text: &'s str) -> Option<Moment> {
            let text = text.trim();
            let (kind, time_of_day, rest) = match self.recurring_suffix(line, text) {
                Some(suffix) => suffix,
                None => self.date_suffix(line, text),
            };

            let (work_state, rest) = grammar::state_mark(rest, self.config)?;
            let (priority, name) = grammar::priority_suffix(rest, self.config.priority_mark);
            trace!(name, line = line.line_num, "moment");

            Some(Moment {
                name: name.to_string(),
                comments: Vec::new(),
                sub_moments: Vec::new(),
                work_state,
                priority,
                category: None,
                time_of_day,
                doc_pos: line_position(line),
                kind,
            })
        }

        /// Splits a trailing `(...)` off `text`: the bracket contents and the trimmed text before it.
        fn bracket_suffix(&self, text: &'s str) -> Option<(&'s str, &'s str)> {
            let left = self.config.left_date_bracket.as_str();
            let right = self.config.right_date_bracket.as_str();
            if !text.ends_with(right) {
                return None;
            }
            let open = text.rfind(left)?;
            let inner = text.get(open + left.len()..text.len() - right.len())?;
            Some((inner, text[..open].trim()))
        }

        fn time_of_day(&self, line: &Line<'s>, inner: &'s str) -> (Option<MomentTime>, &'s str) {
            match grammar::time_suffix(inner, self.config) {
                Some((Token { value, text }, rest)) => (
                    Some(MomentTime {
                        time: value,
                        doc_pos: position(line, text),
                    }),
                    rest,
                ),
                None => (None, inner),
            }
        }

        fn recurring_suffix(&self, line: &Line<'s>, text: &'s str) -> Option<Suffix<'s>> {
            let (inner, before) = self.bracket_suffix(text)?;
            let (time_of_day, phrase) = self.time_of_day(line, inner);
            let phrase = phrase.trim();
            let rule = grammar::recurrence_rule(phrase)?;
            let (recurrence_type, ref_date) = recurrence::anchor(rule, self.today)?;

            let recurrence = Recurrence {
                recurrence_type,
                ref_date: MomentDateTime {
                    dt: start_of_day(ref_date),
                    doc_pos: position(line, phrase),
                },
            };
            Some((MomentKind::Recurring { recurrence }, time_of_day, before))
        }

        fn date_suffix(&self, line: &Line<'s>, text: &'s str) -> Suffix<'s> {
            let undated = MomentKind::Single {
                start: None,
                end: None,
            };
            let Some((inner, before)) = self.bracket_suffix(text) else {
                return (undated, None, text);
            };
            let (time_of_day, dates) = self.time_of_day(line, inner);
            let Some(range) = grammar::date_range(dates, self.config) else {
                return (undated, None, text);
            };

            let start = range.start.map(|token| MomentDateTime {
                dt: start_of_day(token.value),
                doc_pos: position(line, token.text),
            });
            let end = range.end.map(|token| MomentDateTime {
                dt: end_of_day(token.value),
                doc_pos: position(line, token.text),
            });
            (MomentKind::Single { start, end }, time_of_day, before)
        }

        /* ----------------------------- Children ----------------------------- */

        fn collect_children(&mut self, moment: &mut Moment, indent: usize) {
            let threshold = indent + self.config.tab_size;

            while let Some(line) = self.lines.next() {
                let content = line.content.trim_end();
                let (width, skip) = indentation(content, self.config.tab_size, threshold);

                if width >= threshold {
                    self.child_line(moment, line, &content[skip..], threshold);
                } else if content.is_empty() {
                    // Blank separators only count once the moment has comments.
                    if !moment.comments.is_empty() {
                        moment.comments.push(Comment {
                            content: String::new(),
                            doc_pos: DocPosition::new(line.line_num, line.offset, 0),
                        });
                    }
                } else {
                    self.lines.pushback();
                    break;
                }
            }

            while moment.comments.last().is_some_and(|c| c.content.is_empty()) {
                moment.comments.pop();
            }
        }

        fn child_line(&mut self, moment: &mut Moment, line: Line<'s>, text: &'s str, indent: usize) {
            if text.starts_with(&self.config.left_state_bracket) {
                if let Some(sub) = self.moment_block(line, text, indent) {
                    moment.sub_moments.push(sub);
                    return;
                }
                debug!(line = line.line_num, "indented line is not a moment, kept as comment");
            }

            moment.comments.push(Comment {
                content: text.to_string(),
                doc_pos: position(&line, text),
            });
        }
    }

}

pub mod instantiate {
    //! Expands moments into concrete instances inside a window.

    use crate::core::*;
    use crate::recurrence::generate_occurrences;
    use chrono::NaiveDateTime;
    use tracing::trace;

    /// Controls sub-instance expansion and optional filtering of created instances.
    #[derive(Clone, Copy)]
    pub struct InstanceOptions<'f> {
        pub include_subs: bool,
        /// Rejected instances are dropped before their sub-instances are expanded.
        pub filter: Option<&'f dyn Fn(&Instance) -> bool>,
    }

    impl Default for InstanceOptions<'_> {
        fn default() -> Self {
            Self {
                include_subs: true,
                filter: None,
            }
        }
    }

    impl<'f> InstanceOptions<'f> {
        pub fn without_subs(mut self) -> Self {
            self.include_subs = false;
            self
        }

        pub fn with_filter(mut self, filter: &'f dyn Fn(&Instance) -> bool) -> Self {
            self.filter = Some(filter);
            self
        }
    }

    pub fn instances(
        moments: &[Moment],
        start: NaiveDateTime,
        end: NaiveDateTime,
        options: InstanceOptions<'_>,
    ) -> Result<Vec<Instance>, RecurrenceError> {
        let mut out = Vec::new();
        for moment in moments {
            out.extend(instances_of(moment, start, end, options)?);
        }
        Ok(out)
    }

    /// Instances of `moment` in `[start, end]`; `end` is extended to the end of its day.
    /// Sub-moments are instantiated once per parent instance, clipped to that instance's span.
    pub fn instances_of(
        moment: &Moment,
        start: NaiveDateTime,
        end: NaiveDateTime,
        options: InstanceOptions<'_>,
    ) -> Result<Vec<Instance>, RecurrenceError> {
        let end = end_of_day(end.date());
        let mut created = create_instances(moment, start, end)?;
        if let Some(filter) = options.filter {
            created.retain(|inst| filter(inst));
        }

        if options.include_subs && !moment.sub_moments.is_empty() {
            for inst in &mut created {
                inst.sub_instances = instances(&moment.sub_moments, inst.start, inst.end, options)?;
            }
        }
        Ok(created)
    }

    fn create_instances(
        moment: &Moment,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Vec<Instance>, RecurrenceError> {
        match &moment.kind {
            MomentKind::Single {
                start: moment_start,
                end: moment_end,
            } => {
                // Missing bounds are unbounded, so the window decides.
                let upper_start = moment_start.map_or(start, |s| s.dt.max(start));
                let lower_end = moment_end.map_or(end, |e| e.dt.min(end));
                if upper_start > lower_end {
                    return Ok(Vec::new());
                }
                let ends_in_range = moment_end.is_some_and(|e| e.dt <= lower_end);
                Ok(vec![instance(moment, upper_start, lower_end, ends_in_range)])
            }
            MomentKind::Recurring { recurrence } => {
                let mut out = Vec::new();
                for date in generate_occurrences(recurrence, start.date(), end.date()) {
                    let date = date?;
                    trace!(name = %moment.name, %date, "recurring instance");
                    out.push(instance(moment, start_of_day(date), end_of_day(date), true));
                }
                Ok(out)
            }
        }
    }

    fn instance(
        moment: &Moment,
        start: NaiveDateTime,
        end: NaiveDateTime,
        ends_in_range: bool,
    ) -> Instance {
        Instance {
            name: moment.name.clone(),
            start,
            end,
            ends_in_range,
            time_of_day: moment.time_of_day.map(|t| t.time),
            priority: moment.priority,
            category: moment.category.clone(),
            done: moment.is_done(),
            work_state: moment.work_state,
            origin_doc_pos: moment.doc_pos,
            sub_instances: Vec::new(),
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::parser::parse_todos;
        use chrono::NaiveDate;
        use pretty_assertions::assert_eq;

        fn at(day: u32, month: u32, year: i32) -> NaiveDateTime {
            start_of_day(NaiveDate::from_ymd_opt(year, month, day).expect("valid date"))
        }

        fn eod(day: u32, month: u32, year: i32) -> NaiveDateTime {
            end_of_day(at(day, month, year).date())
        }

        fn first(source: &str) -> Moment {
            let config = ParseConfig::default().with_fixed_time(at(1, 6, 2016));
            parse_todos(source, &config)
                .moments
                .into_iter()
                .next()
                .expect("one moment")
        }

        #[test]
        fn window_end_is_extended_to_end_of_day() {
            let m = first("[] a (20.06.2016)");
            let found =
                instances_of(&m, at(20, 6, 2016), at(20, 6, 2016), InstanceOptions::default())
                    .expect("instances");
            assert_eq!(found.len(), 1);
            assert_eq!(found[0].start, at(20, 6, 2016));
            assert_eq!(found[0].end, eod(20, 6, 2016));
            assert!(found[0].ends_in_range);
        }

        #[test]
        fn undated_moment_spans_the_window() {
            let m = first("[] someday");
            let found =
                instances_of(&m, at(1, 6, 2016), at(3, 6, 2016), InstanceOptions::default())
                    .expect("instances");
            assert_eq!(found.len(), 1);
            assert_eq!((found[0].start, found[0].end), (at(1, 6, 2016), eod(3, 6, 2016)));
            assert!(!found[0].ends_in_range);
        }

        #[test]
        fn moment_outside_window_has_no_instance() {
            let m = first("[] a (18.06.2016-25.06.2016)");
            let found =
                instances_of(&m, at(26, 6, 2016), at(30, 6, 2016), InstanceOptions::default())
                    .expect("instances");
            assert!(found.is_empty());
        }

        #[test]
        fn filter_runs_before_sub_expansion() {
            let m = first("[x] done (18.06.2016)\n    [] child (18.06.2016)\n[] other");
            let not_done = |inst: &Instance| !inst.done;
            let found = instances_of(
                &m,
                at(1, 6, 2016),
                at(30, 6, 2016),
                InstanceOptions::default().with_filter(&not_done),
            )
            .expect("instances");
            assert!(found.is_empty());
        }

        #[test]
        fn without_subs_skips_children() {
            let m = first("[] a (18.06.2016)\n    [] b (18.06.2016)");
            let found = instances_of(
                &m,
                at(1, 6, 2016),
                at(30, 6, 2016),
                InstanceOptions::default().without_subs(),
            )
            .expect("instances");
            assert!(found[0].sub_instances.is_empty());
        }

        #[test]
        fn copies_moment_attributes() {
            let m = first("------\nWork\n------\n[w] a !!! (18.06.2016 08:00)");
            let found =
                instances_of(&m, at(1, 6, 2016), at(30, 6, 2016), InstanceOptions::default())
                    .expect("instances");
            let inst = &found[0];
            assert_eq!(inst.name, "a");
            assert_eq!(inst.priority, 3);
            assert_eq!(inst.work_state, WorkState::Waiting);
            assert!(!inst.done);
            assert_eq!(inst.origin_doc_pos, m.doc_pos);
            assert_eq!(inst.category.as_ref().map(|c| c.name.as_str()), Some("Work"));
            assert_eq!(inst.time_of_day, chrono::NaiveTime::from_hms_opt(8, 0, 0));
        }
    }
}

pub mod agenda {
    //! Read-only views over parsed todos for editor and preview consumers: fold ranges,
    //! outline entries, due-soon markers, reminders and the category overview.

    use crate::core::*;
    use crate::instantiate::{InstanceOptions, instances, instances_of};
    use chrono::{Datelike, Days, NaiveDateTime};
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};

    /// Upcoming occurrences within this many days (0 to 10) are due soon.
    pub const DUE_SOON_CUTOFF_DAYS: u64 = 11;

    const NO_CATEGORY: &str = "_none";

    /* ------------------------------- Folding ------------------------------- */

    /// Last line that belongs to `moment`, including its comments and nested sub-moments.
    pub fn bottom_line(moment: &Moment) -> usize {
        let last_comment = moment.comments.last().map(|c| c.doc_pos.line_num);
        let last_sub = moment.sub_moments.last().map(bottom_line);
        moment
            .doc_pos
            .line_num
            .max(last_comment.unwrap_or(0))
            .max(last_sub.unwrap_or(0))
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct FoldRange {
        pub start_line: usize,
        pub end_line: usize,
    }

    /// Foldable ranges of top-level moments spanning more than one line.
    pub fn fold_ranges(todos: &Todos) -> Vec<FoldRange> {
        todos
            .moments
            .iter()
            .map(|m| FoldRange {
                start_line: m.doc_pos.line_num,
                end_line: bottom_line(m),
            })
            .filter(|r| r.end_line > r.start_line)
            .collect()
    }

    /* ------------------------------- Outline ------------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct OutlineEntry {
        pub name: String,
        pub start_line: usize,
        pub end_line: usize,
        /// Literal date, range or recurrence text, followed by the time of day if any.
        pub detail: String,
    }

    pub fn outline(todos: &Todos, source: &str, include_done: bool) -> Vec<OutlineEntry> {
        todos
            .moments
            .iter()
            .filter(|m| include_done || !m.is_done())
            .map(|m| OutlineEntry {
                name: m.name.clone(),
                start_line: m.doc_pos.line_num,
                end_line: bottom_line(m),
                detail: outline_detail(m, source),
            })
            .collect()
    }

    fn outline_detail(moment: &Moment, source: &str) -> String {
        let text = |pos: &DocPosition| pos.slice(source).unwrap_or_default();
        let mut detail = String::new();
        match &moment.kind {
            MomentKind::Single { start, end } => {
                if let Some(start) = start {
                    detail.push_str(text(&start.doc_pos));
                }
                if let Some(end) = end {
                    if start.is_none_or(|s| s.doc_pos != end.doc_pos) {
                        detail.push_str(" - ");
                        detail.push_str(text(&end.doc_pos));
                    }
                }
            }
            MomentKind::Recurring { recurrence } => {
                detail.push_str(text(&recurrence.ref_date.doc_pos));
            }
        }
        if let Some(time) = &moment.time_of_day {
            detail.push(' ');
            detail.push_str(text(&time.doc_pos));
        }
        detail
    }

    /* ------------------------------- Due soon ------------------------------- */

    /// Days until the earliest occurrence of `moment` that ends before the due-soon cutoff,
    /// counted in calendar days from `now`'s date.
    ///
    /// Instants are floating wall-clock times and every instance ends at the end of a day, so a
    /// daylight saving change inside the window cannot move an occurrence across the cutoff.
    pub fn due_in_days(
        moment: &Moment,
        now: NaiveDateTime,
    ) -> Result<Option<i64>, RecurrenceError> {
        let today = now.date();
        let Some(cutoff) = today.checked_add_days(Days::new(DUE_SOON_CUTOFF_DAYS)) else {
            return Ok(None);
        };

        let found = instances_of(
            moment,
            start_of_day(today),
            start_of_day(cutoff),
            InstanceOptions::default().without_subs(),
        )?;
        Ok(found
            .iter()
            .map(|inst| inst.end.date())
            .filter(|end| *end < cutoff)
            .map(|end| (end - today).num_days())
            .min())
    }

    /* ------------------------------- Reminders ------------------------------- */

    /// An instance ending inside the reminder window. `path_name` joins the names of its
    /// ancestors and itself with `/`.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Reminder {
        pub path_name: String,
        pub instance: Instance,
    }

    /// Not-done instances in `[start, end]` that end in range, directly or through a descendant,
    /// sorted by start and flattened parent first.
    pub fn reminders(
        todos: &Todos,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Vec<Reminder>, RecurrenceError> {
        let not_done = |inst: &Instance| !inst.done;
        let found = instances(
            &todos.moments,
            start,
            end,
            InstanceOptions::default().with_filter(&not_done),
        )?;
        let mut kept = ending_in_range(found);
        kept.sort_by_key(|inst| inst.start);

        let mut out = Vec::new();
        flatten(kept, "", &mut out);
        Ok(out)
    }

    fn ending_in_range(found: Vec<Instance>) -> Vec<Instance> {
        found
            .into_iter()
            .filter_map(|mut inst| {
                inst.sub_instances = ending_in_range(std::mem::take(&mut inst.sub_instances));
                (inst.ends_in_range || !inst.sub_instances.is_empty()).then_some(inst)
            })
            .collect()
    }

    fn flatten(found: Vec<Instance>, parent_path: &str, out: &mut Vec<Reminder>) {
        for mut inst in found {
            let path_name = format!("{parent_path}{}", inst.name);
            let subs = std::mem::take(&mut inst.sub_instances);
            let child_path = format!("{path_name}/");
            if inst.ends_in_range {
                out.push(Reminder {
                    path_name,
                    instance: inst,
                });
            }
            flatten(subs, &child_path, out);
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct Agenda {
        pub today: Vec<Reminder>,
        /// Monday to Sunday around `now`.
        pub week: Vec<Reminder>,
    }

    pub fn today_and_week(todos: &Todos, now: NaiveDateTime) -> Result<Agenda, RecurrenceError> {
        let date = now.date();
        let today = reminders(todos, start_of_day(date), end_of_day(date))?;

        let since_monday = u64::from(date.weekday().num_days_from_monday());
        let week = match date
            .checked_sub_days(Days::new(since_monday))
            .and_then(|monday| Some((monday, monday.checked_add_days(Days::new(6))?)))
        {
            Some((monday, sunday)) => reminders(todos, start_of_day(monday), end_of_day(sunday))?,
            None => Vec::new(),
        };
        Ok(Agenda { today, week })
    }

    /* ------------------------------- Overview ------------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct OverviewEntry {
        pub name: String,
        pub work_state: WorkState,
        pub doc_pos: DocPosition,
    }

    /// Not-done top-level moments by category name, in document order.
    pub fn overview(todos: &Todos) -> IndexMap<String, Vec<OverviewEntry>> {
        let mut out: IndexMap<String, Vec<OverviewEntry>> = IndexMap::new();
        for m in todos.moments.iter().filter(|m| !m.is_done()) {
            let category = m
                .category
                .as_ref()
                .map_or(NO_CATEGORY, |c| c.name.as_str());
            out.entry(category.to_string())
                .or_default()
                .push(OverviewEntry {
                    name: m.name.clone(),
                    work_state: m.work_state,
                    doc_pos: m.doc_pos,
                });
        }
        out
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::parser::parse_todos;
        use chrono::{NaiveDate, TimeDelta};
        use pretty_assertions::assert_eq;
        use rstest::rstest;

        fn at(day: u32, month: u32, year: i32) -> NaiveDateTime {
            start_of_day(NaiveDate::from_ymd_opt(year, month, day).expect("valid date"))
        }

        fn parse(source: &str, now: NaiveDateTime) -> Todos {
            parse_todos(source, &ParseConfig::default().with_fixed_time(now))
        }

        // Central European daylight saving starts on 2019-03-31 and ends on 2019-10-27.
        #[rstest]
        #[case(at(23, 3, 2019), "[] a (2.4.19)", Some(10))]
        #[case(at(23, 3, 2019), "[] a (3.4.19)", None)]
        #[case(at(23, 3, 2019), "[] a (1.4.19-3.4.19)", None)]
        #[case(at(23, 3, 2019), "[] a (23.3.19)", Some(0))]
        #[case(at(23, 3, 2019), "[] a (22.3.19)", None)]
        #[case(at(23, 3, 2019), "[] a (20.3.19-25.3.19)", Some(2))]
        #[case(at(23, 3, 2019), "[] a", None)]
        #[case(at(23, 3, 2019) + TimeDelta::minutes(23 * 60 + 30), "[] a (2.4.19)", Some(10))]
        #[case(at(20, 10, 2019), "[] a (30.10.19)", Some(10))]
        #[case(at(20, 10, 2019), "[] a (31.10.19)", None)]
        fn due_soon_across_dst(
            #[case] now: NaiveDateTime,
            #[case] source: &str,
            #[case] expected: Option<i64>,
        ) {
            let todos = parse(source, now);
            let due = due_in_days(&todos.moments[0], now).expect("due");
            assert_eq!(due, expected);
        }

        #[test]
        fn due_soon_picks_earliest_recurrence() {
            // Saturday
            let now = at(23, 3, 2019);
            let todos = parse("[] a (every monday)", now);
            let due = due_in_days(&todos.moments[0], now).expect("due");
            assert_eq!(due, Some(2));
        }

        #[test]
        fn bottom_line_follows_last_descendant() {
            let todos = parse(
                "[] a\n    note\n    [] b\n        [] c\n            deep\n[] d",
                at(1, 1, 2020),
            );
            assert_eq!(bottom_line(&todos.moments[0]), 4);
            assert_eq!(bottom_line(&todos.moments[1]), 5);
        }

        #[test]
        fn folds_only_multi_line_moments() {
            let todos = parse("[] a\n    note\n[] b\n[] c\n    [] d", at(1, 1, 2020));
            assert_eq!(
                fold_ranges(&todos),
                vec![
                    FoldRange {
                        start_line: 0,
                        end_line: 1
                    },
                    FoldRange {
                        start_line: 3,
                        end_line: 4
                    },
                ]
            );
        }

        #[test]
        fn outline_details_use_source_text() {
            let source = "[] a (18.06.2016 - 25.06.2016)\n[] b (21.06.16 13:15)\n[] c (every day 08:00)\n[x] d\n[] e (-1.7.16)";
            let todos = parse(source, at(1, 6, 2016));
            let details: Vec<_> = outline(&todos, source, false)
                .into_iter()
                .map(|o| (o.name, o.detail))
                .collect();
            assert_eq!(
                details,
                vec![
                    ("a".to_string(), "18.06.2016 - 25.06.2016".to_string()),
                    ("b".to_string(), "21.06.16 13:15".to_string()),
                    ("c".to_string(), "every day 08:00".to_string()),
                    ("e".to_string(), " - 1.7.16".to_string()),
                ]
            );
            assert_eq!(outline(&todos, source, true).len(), 5);
        }

        #[test]
        fn reminders_flatten_with_paths() {
            let source = "[] trip (18.06.2016-25.06.2016)\n    [] book hotel (20.06.2016)\n    [x] pack (20.06.2016)\n[] call (21.06.2016)";
            let todos = parse(source, at(1, 6, 2016));
            let found = reminders(&todos, at(20, 6, 2016), at(22, 6, 2016)).expect("reminders");
            let names: Vec<_> = found.iter().map(|r| r.path_name.as_str()).collect();
            assert_eq!(names, vec!["trip/book hotel", "call"]);
            assert!(found.iter().all(|r| r.instance.sub_instances.is_empty()));
        }

        #[test]
        fn today_and_week_use_monday_weeks() {
            // Wednesday
            let now = at(22, 6, 2016);
            let todos = parse(
                "[] mon (20.06.2016)\n[] wed (22.06.2016)\n[] sun (26.06.2016)\n[] next (27.06.2016)",
                now,
            );
            let agenda = today_and_week(&todos, now).expect("agenda");
            let today: Vec<_> = agenda.today.iter().map(|r| r.path_name.as_str()).collect();
            let week: Vec<_> = agenda.week.iter().map(|r| r.path_name.as_str()).collect();
            assert_eq!(today, vec!["wed"]);
            assert_eq!(week, vec!["mon", "wed", "sun"]);
        }

        #[test]
        fn overview_groups_by_category() {
            let source = "[] loose\n------\nWork\n------\n[] a\n[x] b\n[] c\n------\nHome\n------\n[] d";
            let todos = parse(source, at(1, 1, 2020));
            let groups: Vec<_> = overview(&todos)
                .into_iter()
                .map(|(cat, entries)| {
                    (
                        cat,
                        entries.into_iter().map(|e| e.name).collect::<Vec<_>>(),
                    )
                })
                .collect();
            assert_eq!(
                groups,
                vec![
                    ("_none".to_string(), vec!["loose".to_string()]),
                    ("Work".to_string(), vec!["a".to_string(), "c".to_string()]),
                    ("Home".to_string(), vec!["d".to_string()]),
                ]
            );
        }
    }
}

pub use agenda::{DUE_SOON_CUTOFF_DAYS, bottom_line, due_in_days, fold_ranges, outline};
pub use crate::core::{
    Category, Comment, ConfigError, DocPosition, Instance, Moment, MomentDateTime, MomentKind,
    MomentTime, ParseConfig, Recurrence, RecurrenceError, RecurrenceType, Todos, WorkState,
};
pub use instantiate::{InstanceOptions, instances, instances_of};
pub use lines::{Line, LineSource};
pub use parser::{parse_todos, parse_todos_lines};
pub use recurrence::{epoch_week, generate_occurrences, next_occurrence};
