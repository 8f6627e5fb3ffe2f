//! frab schedule XML.
//!
//! The document is first read into a small element tree, then [`parse`]
//! walks that tree into a [`ScheduleDocument`]. Only the parts of the format
//! the importer consumes are interpreted; unknown elements are ignored.

use chrono::{DateTime, NaiveDate, NaiveTime};
use quick_xml::events::{BytesStart, Event};

use downstream_core::errors::PipelineError;
use downstream_core::schedule::{self, Conference, Day, Room, ScheduleDocument, Session};

const DEFAULT_LANGUAGE: &str = "en";
const DEFAULT_SESSION_TYPE: &str = "Talk";

/// One XML element with its attributes, concatenated text and children.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct XmlElement {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub text: String,
    pub children: Vec<XmlElement>,
}

impl XmlElement {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn child(&self, name: &str) -> Option<&XmlElement> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlElement> {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Trimmed text of the first child called `name`.
    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name).map(|c| c.text.trim())
    }

    /// Like [`XmlElement::child_text`], but an empty child counts as absent.
    fn non_empty_child_text(&self, name: &str) -> Option<&str> {
        self.child_text(name).filter(|t| !t.is_empty())
    }
}

/// Read raw bytes into an element tree and return its root.
pub fn read_tree(bytes: &[u8]) -> Result<XmlElement, PipelineError> {
    let mut reader = quick_xml::Reader::from_reader(bytes);
    let mut buf = Vec::new();
    let mut stack: Vec<XmlElement> = Vec::new();
    let mut root: Option<XmlElement> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => stack.push(element_from(e)?),
            Ok(Event::Empty(ref e)) => {
                let element = element_from(e)?;
                close(&mut stack, &mut root, element)?;
            }
            Ok(Event::End(_)) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| PipelineError::malformed("unbalanced closing tag"))?;
                close(&mut stack, &mut root, element)?;
            }
            Ok(Event::Text(ref e)) => {
                if let Some(current) = stack.last_mut() {
                    let text = e
                        .unescape()
                        .map_err(|e| PipelineError::malformed(format!("XML text: {e}")))?;
                    current.text.push_str(&text);
                }
            }
            Ok(Event::CData(e)) => {
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&String::from_utf8_lossy(&e.into_inner()));
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(PipelineError::malformed(format!(
                    "XML at position {}: {e}",
                    reader.buffer_position()
                )))
            }
            _ => {}
        }
        buf.clear();
    }

    if !stack.is_empty() {
        return Err(PipelineError::malformed("unexpected end of document"));
    }
    root.ok_or_else(|| PipelineError::malformed("empty document"))
}

fn element_from(start: &BytesStart<'_>) -> Result<XmlElement, PipelineError> {
    let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
    let mut attributes = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| PipelineError::malformed(format!("attribute on <{name}>: {e}")))?;
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| PipelineError::malformed(format!("attribute {key} on <{name}>: {e}")))?
            .into_owned();
        attributes.push((key, value));
    }
    Ok(XmlElement {
        name,
        attributes,
        ..Default::default()
    })
}

fn close(
    stack: &mut [XmlElement],
    root: &mut Option<XmlElement>,
    element: XmlElement,
) -> Result<(), PipelineError> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(element),
        None if root.is_none() => *root = Some(element),
        None => return Err(PipelineError::malformed("more than one root element")),
    }
    Ok(())
}

/// Interpret a frab element tree.
pub fn parse(root: &XmlElement) -> Result<ScheduleDocument, PipelineError> {
    if root.name != "schedule" {
        return Err(PipelineError::malformed(format!(
            "root element is <{}>, expected <schedule>",
            root.name
        )));
    }

    let version = root
        .child_text("version")
        .ok_or_else(|| PipelineError::malformed("missing <version>"))?
        .to_string();

    let conference = root
        .child("conference")
        .ok_or_else(|| PipelineError::malformed("missing <conference>"))?;
    let conference = Conference {
        title: conference.child_text("title").unwrap_or_default().to_string(),
        start: parse_date(required_text(conference, "start")?)?,
        end: parse_date(required_text(conference, "end")?)?,
    };

    let days = root
        .children_named("day")
        .enumerate()
        .map(|(position, day)| parse_day(day, position))
        .collect::<Result<Vec<_>, _>>()?;
    if days.is_empty() {
        return Err(PipelineError::malformed("schedule has no <day>"));
    }

    Ok(ScheduleDocument {
        version,
        conference,
        days,
    })
}

/// Read raw bytes and interpret them.
pub fn parse_bytes(bytes: &[u8]) -> Result<ScheduleDocument, PipelineError> {
    parse(&read_tree(bytes)?)
}

fn parse_day(day: &XmlElement, position: usize) -> Result<Day, PipelineError> {
    let index = match day.attr("index") {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| PipelineError::malformed(format!("invalid day index {raw:?}")))?,
        None => u32::try_from(position + 1).unwrap_or(u32::MAX),
    };
    let date = parse_date(
        day.attr("date")
            .ok_or_else(|| PipelineError::malformed(format!("day {index} has no date")))?,
    )?;
    let rooms = day
        .children_named("room")
        .map(|room| parse_room(room, date))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Day { index, date, rooms })
}

fn parse_room(room: &XmlElement, day: NaiveDate) -> Result<Room, PipelineError> {
    let name = room
        .attr("name")
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| PipelineError::malformed("room without a name"))?
        .to_string();
    let guid = room
        .attr("guid")
        .map(str::trim)
        .filter(|g| !g.is_empty())
        .map(str::to_string);
    let sessions = room
        .children_named("event")
        .map(|session| parse_session(session, day))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Room {
        name,
        guid,
        sessions,
    })
}

fn parse_session(el: &XmlElement, day: NaiveDate) -> Result<Session, PipelineError> {
    let code = el
        .attr("id")
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .ok_or_else(|| PipelineError::malformed("<event> without an id"))?
        .to_string();
    let malformed = |what: String| PipelineError::malformed(format!("event {code}: {what}"));

    let start = match el.non_empty_child_text("date") {
        Some(raw) => match DateTime::parse_from_rfc3339(raw) {
            Ok(at) => at.naive_local(),
            Err(_) => {
                let date = parse_date(raw).map_err(|e| malformed(e.to_string()))?;
                date.and_time(parse_time(required_text(el, "start")?).map_err(|e| malformed(e.to_string()))?)
            }
        },
        None => day.and_time(parse_time(required_text(el, "start")?).map_err(|e| malformed(e.to_string()))?),
    };
    let duration_minutes =
        parse_duration(required_text(el, "duration")?).map_err(|e| malformed(e.to_string()))?;
    let end = schedule::session_end(start, duration_minutes)
        .ok_or_else(|| malformed(format!("duration of {duration_minutes} minutes is out of range")))?;

    let mut description = el.child_text("description").unwrap_or_default().to_string();
    if let Some(subtitle) = el.non_empty_child_text("subtitle") {
        description = if description.is_empty() {
            subtitle.to_string()
        } else {
            format!("{subtitle}\n\n{description}")
        };
    }

    let do_not_record = el
        .child("recording")
        .and_then(|r| r.child_text("optout"))
        .is_some_and(|v| v.eq_ignore_ascii_case("true"));

    let persons = el
        .child("persons")
        .map(|persons| {
            persons
                .children_named("person")
                .map(|p| p.text.trim())
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Ok(Session {
        guid: el
            .attr("guid")
            .map(str::trim)
            .filter(|g| !g.is_empty())
            .map(str::to_string),
        start,
        duration_minutes,
        end,
        title: el.child_text("title").unwrap_or_default().to_string(),
        description,
        abstract_text: el.child_text("abstract").unwrap_or_default().to_string(),
        track: el.non_empty_child_text("track").map(str::to_string),
        session_type: el
            .non_empty_child_text("type")
            .unwrap_or(DEFAULT_SESSION_TYPE)
            .to_string(),
        language: el
            .non_empty_child_text("language")
            .unwrap_or(DEFAULT_LANGUAGE)
            .to_string(),
        do_not_record,
        persons,
        code,
    })
}

fn required_text<'a>(el: &'a XmlElement, name: &str) -> Result<&'a str, PipelineError> {
    el.non_empty_child_text(name)
        .ok_or_else(|| PipelineError::malformed(format!("<{}> is missing <{name}>", el.name)))
}

/// `YYYY-MM-DD`, or the date part of an RFC 3339 timestamp.
fn parse_date(raw: &str) -> Result<NaiveDate, PipelineError> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .or_else(|_| DateTime::parse_from_rfc3339(raw).map(|at| at.date_naive()))
        .map_err(|_| PipelineError::malformed(format!("invalid date {raw:?}")))
}

/// `HH:MM` or `HH:MM:SS`.
fn parse_time(raw: &str) -> Result<NaiveTime, PipelineError> {
    NaiveTime::parse_from_str(raw, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
        .map_err(|_| PipelineError::malformed(format!("invalid start time {raw:?}")))
}

/// `HH:MM` in minutes. Hours may exceed 23.
fn parse_duration(raw: &str) -> Result<i64, PipelineError> {
    let invalid = || PipelineError::malformed(format!("invalid duration {raw:?}"));
    let (hours, minutes) = raw.split_once(':').ok_or_else(invalid)?;
    let minutes = minutes.split(':').next().unwrap_or(minutes);
    let hours: i64 = hours.parse().map_err(|_| invalid())?;
    let minutes: i64 = minutes.parse().map_err(|_| invalid())?;
    if hours < 0 || !(0..60).contains(&minutes) {
        return Err(invalid());
    }
    hours
        .checked_mul(60)
        .and_then(|m| m.checked_add(minutes))
        .ok_or_else(invalid)
}
