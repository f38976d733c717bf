//! Reads TMS trial-definition files into an [`ExperimentPlan`].
//!
//! A TMS file is plain text. The first line is a free-text title, the
//! second a format-version marker, and the third the *codehead*: the
//! researcher's own tab-separated column labels, appended to the generic
//! results header. After that, every trial takes two lines:
//!
//! ```text
//! <reaction timeout>\t<reaction offset>\t<coding tag...>
//! <screen item>\t<monitor on>\t<monitor off>
//! ```
//!
//! Times are written as floating point milliseconds (`2000.0`) and are
//! truncated to whole milliseconds. The coding tag is everything after the
//! second tab, so it may hold several tab-separated codes.

use log::{debug, warn};
use nom::{
    branch::alt,
    bytes::complete::{tag, take_till, take_while},
    character::complete::char,
    combinator::{eof, map, peek, rest},
    number::complete::double,
    sequence::{delimited, preceded, terminated, tuple},
    Finish, IResult,
};
use std::{
    borrow::Cow,
    fmt, fs, io,
    path::{Path, PathBuf},
};

/// Extension that trial-definition files must carry.
pub const TMS_EXTENSION: &str = "tms";

/// Milliseconds reserved for talking to the controller box. Every reaction
/// timeout is shortened by this much. The value comes from the first
/// generation of the hardware and must not change.
pub const COMM_RESERVE_MS: i32 = 400;

/// Number of lines before the first trial.
const HEADER_LINES: usize = 3;

/// One scripted stimulus presentation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialSpec {
    /// Reaction timeout sent to the box, already corrected for
    /// [`COMM_RESERVE_MS`].
    pub reaction_timeout_ms: i32,
    /// Offset subtracted from the box's timer counts.
    pub reaction_offset_ms: i32,
    /// When the monitors come on, relative to the cue.
    pub monitor_on_ms: i32,
    /// When they go off again.
    pub monitor_off_ms: i32,
    /// Researcher codes, copied into every result row of the trial.
    pub coding_tag: String,
    /// The word or picture name shown to the participants.
    pub screen_item: String,
}

/// A parsed trial-definition file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExperimentPlan {
    source_path: PathBuf,
    code_header: String,
    trials: Vec<TrialSpec>,
}

impl ExperimentPlan {
    /// Where the plan was read from.
    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    /// The researcher-specific result column labels.
    pub fn code_header(&self) -> &str {
        &self.code_header
    }

    /// The trials, in file order.
    pub fn trials(&self) -> &[TrialSpec] {
        &self.trials
    }

    /// Number of trials.
    pub fn trial_count(&self) -> usize {
        self.trials.len()
    }

    /// The audio cue that belongs to this plan: a `.wav` file with the same
    /// name, next to the TMS file.
    pub fn audio_path(&self) -> PathBuf {
        self.source_path.with_extension("wav")
    }
}

/// Everything that can go wrong while reading a TMS file.
#[derive(Debug)]
#[allow(missing_docs)]
pub enum ParseError {
    /// The path is not a `.tms` file, or there is nothing there.
    InvalidFile { path: PathBuf, reason: &'static str },

    /// The file exists but could not be read.
    Io { path: PathBuf, error: io::Error },

    /// The file has no lines at all.
    Empty,

    /// The file ends before the codehead line.
    MissingHeader,

    /// The header is there but not a single complete trial follows it.
    NoTrials,

    /// A trial's lines could not be parsed. `line` is 1-based and refers
    /// to the file as a whole.
    MalformedTrial {
        trial: usize,
        line: usize,
        reason: String,
    },
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use ParseError as PE;
        let msg = match self {
            PE::InvalidFile { path, reason } => {
                Cow::from(format!("invalid file {}: {}", path.display(), reason))
            }
            PE::Io { path, error } => {
                Cow::from(format!("could not read {}: {}", path.display(), error))
            }
            PE::Empty => Cow::from("file is empty"),
            PE::MissingHeader => Cow::from("file lacks the first three header lines"),
            PE::NoTrials => Cow::from("file has no trials"),
            PE::MalformedTrial {
                trial,
                line,
                reason,
            } => Cow::from(format!("trial {} (line {}) is malformed: {}", trial, line, reason)),
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for ParseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ParseError::Io { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Reads and parses the TMS file at `path`.
pub fn parse(path: impl AsRef<Path>) -> Result<ExperimentPlan, ParseError> {
    let path = path.as_ref();
    check_path(path)?;

    let bytes = fs::read(path).map_err(|error| ParseError::Io {
        path: path.to_path_buf(),
        error,
    })?;
    let text = decode_text(&bytes);

    let mut plan = parse_str(&text)?;
    plan.source_path = path.to_path_buf();
    debug!(
        "parsed {} trials from {}",
        plan.trial_count(),
        path.display()
    );
    Ok(plan)
}

/// Parses TMS text. The returned plan has an empty source path.
pub fn parse_str(text: &str) -> Result<ExperimentPlan, ParseError> {
    let mut lines: Vec<&str> = text.lines().collect();
    if lines.is_empty() {
        return Err(ParseError::Empty);
    }
    if lines.len() < HEADER_LINES {
        return Err(ParseError::MissingHeader);
    }

    // A trailing line terminator, or several, must not become a trial.
    while lines.len() > HEADER_LINES && lines.last().is_some_and(|l| l.trim().is_empty()) {
        lines.pop();
    }

    let count = trial_count(lines.len());
    if count == 0 {
        return Err(ParseError::NoTrials);
    }

    let body = &lines[HEADER_LINES..];
    if body.len() % 2 == 1 {
        warn!(
            "ignoring unpaired last line {}: {:?}",
            lines.len(),
            body[body.len() - 1]
        );
    }

    let trials = body
        .chunks_exact(2)
        .enumerate()
        .map(|(i, pair)| parse_trial(i, pair[0], pair[1]))
        .collect::<Result<Vec<_>, _>>()?;
    debug_assert_eq!(trials.len(), count);

    Ok(ExperimentPlan {
        source_path: PathBuf::new(),
        code_header: lines[HEADER_LINES - 1].trim().to_owned(),
        trials,
    })
}

/// Number of complete trials in a file of `total_lines` lines.
///
/// `floor((total_lines - 2) / 2)` counts one trial too many when the last
/// line has no partner (then `total_lines - 2` is even), so that case
/// drops one. The result is always `floor(body / 2)` for the lines after
/// the header.
pub fn trial_count(total_lines: usize) -> usize {
    if total_lines < HEADER_LINES {
        return 0;
    }
    let mut count = (total_lines - 2) / 2;
    if (total_lines - 2) % 2 == 0 {
        count -= 1;
    }
    count
}

fn check_path(path: &Path) -> Result<(), ParseError> {
    let has_extension = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(TMS_EXTENSION));
    if !has_extension {
        return Err(ParseError::InvalidFile {
            path: path.to_path_buf(),
            reason: "file does not have a .tms extension",
        });
    }
    if !path.is_file() {
        return Err(ParseError::InvalidFile {
            path: path.to_path_buf(),
            reason: "file does not exist",
        });
    }
    Ok(())
}

/// Lab files from older machines are Latin-1; everything else is UTF-8.
fn decode_text(bytes: &[u8]) -> Cow<'_, str> {
    match std::str::from_utf8(bytes) {
        Ok(s) => Cow::Borrowed(s),
        Err(_) => {
            debug!("file is not UTF-8, decoding as Latin-1");
            Cow::Owned(bytes.iter().map(|&b| b as char).collect())
        }
    }
}

fn parse_trial(index: usize, timing: &str, visual: &str) -> Result<TrialSpec, ParseError> {
    let first_line = HEADER_LINES + 2 * index + 1;
    let malformed = |line: usize, what: &str, input: &str| ParseError::MalformedTrial {
        trial: index + 1,
        line,
        reason: format!("{} near {:?}", what, input),
    };

    let (_, (raw_timeout, raw_offset, coding_tag)) = timing_line(timing)
        .finish()
        .map_err(|e| malformed(first_line, "expected timeout, offset and code", e.input))?;
    let (_, (screen_item, monitor_on_ms, monitor_off_ms)) = visual_line(visual)
        .finish()
        .map_err(|e| malformed(first_line + 1, "expected item, monitor on and off", e.input))?;

    Ok(TrialSpec {
        reaction_timeout_ms: raw_timeout + raw_offset - COMM_RESERVE_MS,
        reaction_offset_ms: raw_offset,
        monitor_on_ms,
        monitor_off_ms,
        coding_tag: coding_tag.trim().to_owned(),
        screen_item: screen_item.trim().to_owned(),
    })
}

fn blank(s: &str) -> IResult<&str, &str> {
    take_while(|c: char| c == ' ')(s)
}

/// A time cell: floating point text, truncated to whole milliseconds.
fn millis(s: &str) -> IResult<&str, i32> {
    map(delimited(blank, double, blank), |v: f64| v as i32)(s)
}

/// The end of a cell, without consuming a following tab.
fn cell_end(s: &str) -> IResult<&str, &str> {
    peek(alt((eof, tag("\t"))))(s)
}

fn cell(s: &str) -> IResult<&str, &str> {
    take_till(|c| c == '\t')(s)
}

fn timing_line(s: &str) -> IResult<&str, (i32, i32, &str)> {
    tuple((
        millis,
        preceded(char('\t'), millis),
        preceded(char('\t'), rest),
    ))(s)
}

fn visual_line(s: &str) -> IResult<&str, (&str, i32, i32)> {
    tuple((
        cell,
        preceded(char('\t'), millis),
        preceded(char('\t'), terminated(millis, cell_end)),
    ))(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SHORT: &str = "%% CROSSMODAL\n\
                         TMS 2.0\n\
                         Cond\tList \n\
                         2000.0\t500.0\tA\t1\n\
                         darsh\t100.0\t900.0\n\
                         1800.5\t450\tB\t2\n\
                         scarble\t0\t1500.0\n";

    fn tms_file(contents: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".tms").tempfile().unwrap();
        file.write_all(contents).unwrap();
        file
    }

    #[test]
    fn parses_short_file() {
        let plan = parse_str(SHORT).unwrap();

        assert_eq!(plan.code_header(), "Cond\tList");
        assert_eq!(plan.trial_count(), 2);
        assert_eq!(
            plan.trials()[0],
            TrialSpec {
                reaction_timeout_ms: 2000 + 500 - 400,
                reaction_offset_ms: 500,
                monitor_on_ms: 100,
                monitor_off_ms: 900,
                coding_tag: "A\t1".to_owned(),
                screen_item: "darsh".to_owned(),
            }
        );
        assert_eq!(plan.trials()[1].reaction_timeout_ms, 1800 + 450 - 400);
        assert_eq!(plan.trials()[1].screen_item, "scarble");
    }

    #[test]
    fn corrected_timeout_holds_for_every_trial() {
        let raw = [(2000, 500), (400, 0), (0, 0), (3123, 17), (1, 1)];
        let mut text = String::from("title\nversion\ncodes\n");
        for (i, (timeout, offset)) in raw.iter().enumerate() {
            text.push_str(&format!("{}.0\t{}.9\tc{}\n", timeout, offset, i));
            text.push_str(&format!("item{}\t0\t0\n", i));
        }

        let plan = parse_str(&text).unwrap();
        assert_eq!(plan.trial_count(), plan.trials().len());
        for (trial, (timeout, offset)) in plan.trials().iter().zip(raw) {
            assert_eq!(trial.reaction_offset_ms, offset);
            assert_eq!(trial.reaction_timeout_ms, timeout + offset - COMM_RESERVE_MS);
        }
    }

    #[test]
    fn trial_count_parity_boundary() {
        // header + 2 complete trials
        assert_eq!(trial_count(7), 2);
        // one unpaired line after them
        assert_eq!(trial_count(8), 2);
        assert_eq!(trial_count(9), 3);
        assert_eq!(trial_count(3), 0);
        assert_eq!(trial_count(4), 0);
        assert_eq!(trial_count(2), 0);
    }

    #[test]
    fn parity_boundary_files() {
        let exact = "t\nv\nc\n1\t2\tx\ni\t3\t4\n5\t6\ty\nj\t7\t8";
        assert_eq!(exact.lines().count(), 7);
        assert_eq!(parse_str(exact).unwrap().trial_count(), 2);

        let dangling = format!("{}\n9\t9\tz", exact);
        assert_eq!(dangling.lines().count(), 8);
        assert_eq!(parse_str(&dangling).unwrap().trial_count(), 2);

        let trailing_blank = format!("{}\n\n\r\n", exact);
        let plan = parse_str(&trailing_blank).unwrap();
        assert_eq!(plan.trial_count(), 2);
        assert_eq!(plan.trials()[1].screen_item, "j");
    }

    #[test]
    fn crlf_lines() {
        let text = SHORT.replace('\n', "\r\n");
        let plan = parse_str(&text).unwrap();
        assert_eq!(plan.trial_count(), 2);
        assert_eq!(plan.trials()[0].monitor_off_ms, 900);
        assert_eq!(plan.trials()[1].monitor_off_ms, 1500);
    }

    #[test]
    fn malformed_row_aborts_parse() {
        let text = SHORT.replace("1800.5\t450", "1800.5\tsoon");
        match parse_str(&text) {
            Err(ParseError::MalformedTrial { trial, line, .. }) => {
                assert_eq!(trial, 2);
                assert_eq!(line, 6);
            }
            other => panic!("expected malformed trial, got {:?}", other),
        }

        let text = SHORT.replace("darsh\t100.0\t900.0", "darsh\t100.0");
        assert!(matches!(
            parse_str(&text),
            Err(ParseError::MalformedTrial { trial: 1, line: 5, .. })
        ));
    }

    #[test]
    fn trailing_junk_in_monitor_off() {
        for junk in ["900.0abc", "900.0 soon"] {
            let row = format!("darsh\t100.0\t{}", junk);
            let text = SHORT.replace("darsh\t100.0\t900.0", &row);
            assert!(
                matches!(
                    parse_str(&text),
                    Err(ParseError::MalformedTrial { trial: 1, line: 5, .. })
                ),
                "{:?} was accepted",
                junk
            );
        }

        // Extra cells after monitor off are still ignored.
        let text = SHORT.replace("darsh\t100.0\t900.0", "darsh\t100.0\t900.0 \tnote");
        let plan = parse_str(&text).unwrap();
        assert_eq!(plan.trials()[0].monitor_off_ms, 900);
    }

    #[test]
    fn short_files() {
        assert!(matches!(parse_str(""), Err(ParseError::Empty)));
        assert!(matches!(parse_str("a\nb"), Err(ParseError::MissingHeader)));
        assert!(matches!(parse_str("a\nb\nc\n"), Err(ParseError::NoTrials)));
        assert!(matches!(parse_str("a\nb\nc\n1\t2\tx"), Err(ParseError::NoTrials)));
    }

    #[test]
    fn parse_from_disk() {
        let file = tms_file(SHORT.as_bytes());
        let plan = parse(file.path()).unwrap();

        assert_eq!(plan.source_path(), file.path());
        assert_eq!(plan.trial_count(), 2);
        assert_eq!(plan.audio_path(), file.path().with_extension("wav"));
    }

    #[test]
    fn latin1_screen_items() {
        let mut bytes = SHORT.replace("darsh", "M?dchen").into_bytes();
        let at = bytes.iter().position(|&b| b == b'?').unwrap();
        bytes[at] = 0xE4;
        let file = tms_file(&bytes);

        let plan = parse(file.path()).unwrap();
        assert_eq!(plan.trials()[0].screen_item, "M\u{e4}dchen");
    }

    #[test]
    fn rejects_bad_paths() {
        let mut wrong_ext = tempfile::Builder::new().suffix(".txt").tempfile().unwrap();
        wrong_ext.write_all(SHORT.as_bytes()).unwrap();
        assert!(matches!(
            parse(wrong_ext.path()),
            Err(ParseError::InvalidFile { .. })
        ));

        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("charlie_shorts.tms");
        assert!(matches!(parse(missing), Err(ParseError::InvalidFile { .. })));

        let upper = dir.path().join("UPPER.TMS");
        fs::write(&upper, SHORT).unwrap();
        assert_eq!(parse(upper).unwrap().trial_count(), 2);
    }
}
