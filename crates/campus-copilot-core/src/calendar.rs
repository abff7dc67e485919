//! iCalendar (RFC 5545) event extraction.
//!
//! Only what the events feed needs is read: `VEVENT` components and their
//! `UID`, `SUMMARY`, `DTSTART`, `LOCATION`, `DESCRIPTION` and `URL`
//! properties. Folded lines are unfolded and text escapes are decoded.
//! Nested components (`VALARM`) are skipped.
//!
//! Start times ending in `Z` are UTC. Floating times and times carrying a
//! `TZID` parameter are read as UTC wall-clock, since no time zone
//! database is bundled. `VALUE=DATE` starts are all-day events at
//! midnight UTC.
//!
//! # Example
//!
//! ```rust
//! use campus_copilot_core::calendar::parse_calendar;
//!
//! let ics = "BEGIN:VCALENDAR\r\nBEGIN:VEVENT\r\nSUMMARY:Career Fair\r\n\
//!            DTSTART:20261020T170000Z\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";
//! let events = parse_calendar(ics);
//! assert_eq!(events[0].title, "Career Fair");
//! ```

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarEvent {
    pub uid: Option<String>,
    pub title: String,
    pub start: DateTime<Utc>,
    pub all_day: bool,
    pub location: Option<String>,
    pub description: Option<String>,
    pub url: Option<String>,
}

impl CalendarEvent {
    /// `YYYY-MM-DD HH:MM`, or the bare date for all-day events.
    pub fn start_label(&self) -> String {
        if self.all_day {
            self.start.format("%Y-%m-%d").to_string()
        } else {
            self.start.format("%Y-%m-%d %H:%M").to_string()
        }
    }

    /// Plain-text rendering used as the indexed passage.
    pub fn to_text(&self) -> String {
        let mut text = format!("Event: {}\nWhen: {}", self.title, self.start_label());
        if self.all_day {
            text.push_str(" (all day)");
        } else {
            text.push_str(" UTC");
        }
        if let Some(location) = &self.location {
            text.push_str("\nWhere: ");
            text.push_str(location);
        }
        if let Some(description) = &self.description {
            text.push_str("\n\n");
            text.push_str(description);
        }
        text
    }
}

#[derive(Default)]
struct Draft {
    uid: Option<String>,
    title: Option<String>,
    start: Option<(DateTime<Utc>, bool)>,
    location: Option<String>,
    description: Option<String>,
    url: Option<String>,
}

impl Draft {
    fn finish(self) -> Option<CalendarEvent> {
        let (start, all_day) = self.start?;
        let title = self.title.filter(|t| !t.is_empty())?;
        Some(CalendarEvent {
            uid: self.uid,
            title,
            start,
            all_day,
            location: self.location.filter(|l| !l.is_empty()),
            description: self.description.filter(|d| !d.is_empty()),
            url: self.url,
        })
    }
}

/// Every `VEVENT` that has a title and a parseable start, in feed order.
pub fn parse_calendar(ics: &str) -> Vec<CalendarEvent> {
    let mut events = Vec::new();
    let mut draft: Option<Draft> = None;
    let mut nested = 0usize;

    for line in unfold(ics) {
        let Some((name, params, value)) = split_property(&line) else {
            continue;
        };
        match (name.as_str(), value) {
            ("BEGIN", "VEVENT") if draft.is_none() => draft = Some(Draft::default()),
            ("END", "VEVENT") if nested == 0 => {
                if let Some(event) = draft.take().and_then(Draft::finish) {
                    events.push(event);
                }
            }
            ("BEGIN", _) if draft.is_some() => nested += 1,
            ("END", _) if draft.is_some() => nested = nested.saturating_sub(1),
            _ => {}
        }
        let Some(d) = draft.as_mut() else {
            continue;
        };
        if nested > 0 {
            continue;
        }
        match name.as_str() {
            "UID" => d.uid = Some(value.to_string()),
            "SUMMARY" => d.title = Some(unescape(value)),
            "LOCATION" => d.location = Some(unescape(value)),
            "DESCRIPTION" => d.description = Some(unescape(value)),
            "URL" => d.url = Some(value.to_string()),
            "DTSTART" => d.start = parse_start(value, &params),
            _ => {}
        }
    }
    events
}

/// Events starting at or after `now`, earliest first, at most `limit`.
/// All-day events count as upcoming for their whole day.
pub fn upcoming(mut events: Vec<CalendarEvent>, now: DateTime<Utc>, limit: usize) -> Vec<CalendarEvent> {
    events.retain(|e| {
        if e.all_day {
            e.start.date_naive() >= now.date_naive()
        } else {
            e.start >= now
        }
    });
    events.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.title.cmp(&b.title)));
    events.truncate(limit);
    events
}

/// Join continuation lines (leading space or tab) onto their predecessor.
fn unfold(ics: &str) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    for raw in ics.lines() {
        let raw = raw.strip_suffix('\r').unwrap_or(raw);
        match (raw.strip_prefix([' ', '\t']), lines.last_mut()) {
            (Some(rest), Some(prev)) => prev.push_str(rest),
            _ => lines.push(raw.to_string()),
        }
    }
    lines
}

/// `NAME;P1=a;P2="b:c":value` → (upper-case name, params, value).
fn split_property(line: &str) -> Option<(String, Vec<(String, String)>, &str)> {
    let mut quoted = false;
    let colon = line.char_indices().find_map(|(i, c)| match c {
        '"' => {
            quoted = !quoted;
            None
        }
        ':' if !quoted => Some(i),
        _ => None,
    })?;
    let (head, value) = (&line[..colon], &line[colon + 1..]);
    let mut parts = head.split(';');
    let name = parts.next()?.trim().to_ascii_uppercase();
    let params = parts
        .filter_map(|p| p.split_once('='))
        .map(|(k, v)| (k.trim().to_ascii_uppercase(), v.trim_matches('"').to_string()))
        .collect();
    Some((name, params, value.trim()))
}

fn parse_start(value: &str, params: &[(String, String)]) -> Option<(DateTime<Utc>, bool)> {
    let date_only = params
        .iter()
        .any(|(k, v)| k == "VALUE" && v.eq_ignore_ascii_case("DATE"))
        || value.len() == 8;
    if date_only {
        let date = NaiveDate::parse_from_str(value, "%Y%m%d").ok()?;
        return Some((date.and_hms_opt(0, 0, 0)?.and_utc(), true));
    }
    let wall = value.strip_suffix('Z').unwrap_or(value);
    let naive = NaiveDateTime::parse_from_str(wall, "%Y%m%dT%H%M%S").ok()?;
    Some((naive.and_utc(), false))
}

fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n' | 'N') => out.push('\n'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const FEED: &str = "BEGIN:VCALENDAR\r\n\
VERSION:2.0\r\n\
BEGIN:VEVENT\r\n\
UID:fair-2026@campus\r\n\
SUMMARY:Career Fair\\, Fall Edition\r\n\
DTSTART:20261022T150000Z\r\n\
LOCATION:Student Union\\; Ballroom A\r\n\
DESCRIPTION:Bring copies of your resume.\\nEmployers from 40 companies\r\n  will attend.\r\n\
URL:https://events.example.edu/fair\r\n\
BEGIN:VALARM\r\n\
DESCRIPTION:Reminder\r\n\
END:VALARM\r\n\
END:VEVENT\r\n\
BEGIN:VEVENT\r\n\
SUMMARY:Homecoming\r\n\
DTSTART;VALUE=DATE:20261030\r\n\
END:VEVENT\r\n\
BEGIN:VEVENT\r\n\
SUMMARY:Orientation\r\n\
DTSTART;TZID=America/Chicago:20260815T090000\r\n\
END:VEVENT\r\n\
BEGIN:VEVENT\r\n\
SUMMARY:No start time\r\n\
END:VEVENT\r\n\
END:VCALENDAR\r\n";

    #[test]
    fn test_parse_reads_properties_and_skips_alarms() {
        let events = parse_calendar(FEED);
        assert_eq!(events.len(), 3);

        let fair = &events[0];
        assert_eq!(fair.uid.as_deref(), Some("fair-2026@campus"));
        assert_eq!(fair.title, "Career Fair, Fall Edition");
        assert_eq!(fair.start, Utc.with_ymd_and_hms(2026, 10, 22, 15, 0, 0).unwrap());
        assert_eq!(fair.location.as_deref(), Some("Student Union; Ballroom A"));
        assert_eq!(
            fair.description.as_deref(),
            Some("Bring copies of your resume.\nEmployers from 40 companies will attend.")
        );
        assert_eq!(fair.url.as_deref(), Some("https://events.example.edu/fair"));

        assert!(events[1].all_day);
        assert_eq!(events[1].start_label(), "2026-10-30");
        assert_eq!(events[2].start_label(), "2026-08-15 09:00");
    }

    #[test]
    fn test_upcoming_sorts_filters_and_limits() {
        let now = Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap();
        let events = upcoming(parse_calendar(FEED), now, 10);
        let titles: Vec<_> = events.iter().map(|e| e.title.as_str()).collect();
        assert_eq!(titles, vec!["Career Fair, Fall Edition", "Homecoming"]);

        let first_only = upcoming(parse_calendar(FEED), now, 1);
        assert_eq!(first_only.len(), 1);
    }

    #[test]
    fn test_all_day_event_is_upcoming_on_its_day() {
        let evening = Utc.with_ymd_and_hms(2026, 10, 30, 20, 0, 0).unwrap();
        let events = upcoming(parse_calendar(FEED), evening, 10);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].title, "Homecoming");
    }

    #[test]
    fn test_event_text() {
        let fair = parse_calendar(FEED).remove(0);
        let text = fair.to_text();
        assert!(text.starts_with("Event: Career Fair, Fall Edition\nWhen: 2026-10-22 15:00 UTC"));
        assert!(text.contains("Where: Student Union; Ballroom A"));
    }

    #[test]
    fn test_garbage_yields_nothing() {
        assert!(parse_calendar("not a calendar").is_empty());
        assert!(parse_calendar("").is_empty());
    }
}
