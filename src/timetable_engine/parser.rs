//! HTML scrapers for the upstream pages: the weekly timetable table, the
//! homework snippet, the teacher list, and the week-offset navigation.
//!
//! All functions are synchronous; a parsed document never lives across an
//! await point. Selectors and regexes are compiled once.

use std::collections::HashMap;

use lazy_static::lazy_static;
use regex::Regex;
use ego_tree::NodeRef;
use scraper::{ElementRef, Html, Node, Selector};
use tracing::{debug, warn};

use super::dates::{format_academic_year, parse_time_range, to_iso_date};
use super::model::{Event, StudentInfo, WeekInfo};

/// Marker prefix of the student info line on the timetable page.
const STUDENT_INFO_MARKER: &str = "Næmingatímatalva";

/// Phrases the upstream uses for a week without lessons when the timetable
/// table itself is missing.
const NO_LESSONS_PHRASES: [&str; 3] = ["ongi skeið", "frídagur", "eingin undirvísing"];

/// Cell classes marking a cancelled lesson.
const CANCELLED_CLASSES: [&str; 8] = [
    "lektionslinje_lesson1",
    "lektionslinje_lesson2",
    "lektionslinje_lesson3",
    "lektionslinje_lesson4",
    "lektionslinje_lesson5",
    "lektionslinje_lesson7",
    "lektionslinje_lesson10",
    "lektionslinje_lessoncancelled",
];

lazy_static! {
    static ref TABLE_SEL: Selector = Selector::parse("table.time_8_16").unwrap();
    static ref TR_SEL: Selector = Selector::parse("tr").unwrap();
    static ref TD_SEL: Selector = Selector::parse("td").unwrap();
    static ref A_SEL: Selector = Selector::parse("a").unwrap();
    static ref B_SEL: Selector = Selector::parse("b").unwrap();
    static ref SELECT_SEL: Selector = Selector::parse("select").unwrap();
    static ref OPTION_SEL: Selector = Selector::parse("option").unwrap();
    static ref WEEK_LINK_SEL: Selector = Selector::parse("a.UgeKnapValgt").unwrap();
    static ref NAV_LINK_SEL: Selector = Selector::parse(r#"a[onclick*="v="]"#).unwrap();
    static ref LESSON_SPAN_SEL: Selector =
        Selector::parse(r#"span[id^="MyWindow"][id$="Main"]"#).unwrap();
    static ref NOTE_INPUT_SEL: Selector =
        Selector::parse(r#"input[type="image"][src*="note.gif"]"#).unwrap();
    static ref LESSON_ID_INPUT_SEL: Selector =
        Selector::parse(r#"input[type="hidden"][id^="LektionsID"]"#).unwrap();
    static ref NO_LESSONS_SCOPE_SEL: Selector = Selector::parse("p, div.alert, td.header").unwrap();

    static ref LESSON_CLASS_RE: Regex = Regex::new(r"^lektionslinje_lesson\d+$").unwrap();
    static ref DAY_DATE_RE: Regex = Regex::new(r"^(\w+)\s+(\d{1,2}/\d{1,2})").unwrap();
    static ref DATE_RANGE_RE: Regex =
        Regex::new(r"(\d{1,2}\.\d{1,2}\.\d{4})\s*-\s*(\d{1,2}\.\d{1,2}\.\d{4})").unwrap();
    static ref STUDENT_INFO_RE: Regex =
        Regex::new(r"Næmingatímatalva\s*:\s*(.*?)\s*,\s*([\w\s]+)").unwrap();
    static ref WEEK_OFFSET_RE: Regex = Regex::new(r"v=(-?\d+)").unwrap();
    static ref TEACHER_WITH_LINK_RE: Regex =
        Regex::new(r"([^<>]+?)\s*\(\s*<a[^>]*?>([A-Z]{2,4})</a>\s*\)").unwrap();
    static ref TEACHER_NO_LINK_RE: Regex =
        Regex::new(r"([^<>]+?)\s*\(\s*([A-Z]{2,4})\s*\)").unwrap();
    static ref SPACE_BEFORE_NEWLINE_RE: Regex = Regex::new(r" +\n").unwrap();
    static ref SPACE_AFTER_NEWLINE_RE: Regex = Regex::new(r"\n +").unwrap();
    static ref FALLBACK_DAY_RE: Regex = Regex::new(
        r"(Mánadagur|Týsdagur|Mikudagur|Hósdagur|Fríggjadagur|Leygardagur|Sunnudagur)\s+(\d{1,2}/\d{1,2})"
    )
    .unwrap();
    static ref FALLBACK_EVENT_RE: Regex =
        Regex::new(r"(\w+(?:-\w+){3,})\s+([A-Z]{2,4})\s+(?:st\.\s*)?([\w.]+)").unwrap();
}

/// Everything scraped from one week page.
#[derive(Debug)]
pub struct WeekParse {
    pub student_info: Option<StudentInfo>,
    pub week_info: WeekInfo,
    pub events: Vec<Event>,
    /// Lesson ids carrying a homework note, in document order.
    pub homework_ids: Vec<String>,
}

/// Parses one week's timetable HTML.
///
/// Returns `None` when the page has no timetable table and no explicit
/// "no lessons" message; the orchestrator treats that as "no data" for the
/// offset.
pub fn parse_week_html(
    html: &str,
    offset: i32,
    fallback_year: i32,
    teacher_map: &HashMap<String, String>,
) -> Option<WeekParse> {
    let doc = Html::parse_document(html);

    let week_info = parse_week_info(&doc, html, offset, fallback_year);
    let (student_info, student_text) = parse_student_info(&doc);
    // Anchors day-cell dates like `24/3`; the week info carries the same
    // year, falling back to the current year when the date range is absent.
    let resolution_year = week_info.year.unwrap_or(fallback_year);

    let Some(table) = doc.select(&TABLE_SEL).next() else {
        if has_no_lessons_message(&doc) {
            debug!("week {offset}: upstream says no lessons, returning empty week");
            return Some(WeekParse {
                student_info,
                week_info,
                events: Vec::new(),
                homework_ids: Vec::new(),
            });
        }
        warn!("week {offset}: timetable table missing and no 'no lessons' message");
        return None;
    };

    let mut events = Vec::new();
    let mut homework_ids = Vec::new();
    let mut day_context: Option<(String, String)> = None;

    for row in table.select(&TR_SEL) {
        let cells: Vec<ElementRef> = row.select(&TD_SEL).collect();
        let Some(first_cell) = cells.first() else {
            continue;
        };

        if has_any_class(first_cell, &["lektionslinje_1", "lektionslinje_1_aktuel"]) {
            let text = collapsed_text(*first_cell);
            if let Some(captures) = DAY_DATE_RE.captures(&text) {
                day_context = Some((captures[1].to_string(), captures[2].to_string()));
            } else {
                warn!("week {offset}: day header without day/date text {text:?}");
                day_context = None;
            }
        }
        let Some((day_fo, date_part)) = day_context.clone() else {
            continue;
        };
        let day_en = day_name_to_english(&day_fo);

        let mut column: u32 = 1;
        for (index, cell) in cells.iter().enumerate() {
            let colspan = cell
                .value()
                .attr("colspan")
                .and_then(|v| v.trim().parse::<u32>().ok())
                .unwrap_or(1);
            // The leading day-header/spacer cell is never a lesson but its
            // colspan still counts toward the column position.
            if index > 0 {
                let classes: Vec<&str> = cell.value().classes().collect();
                if classes.iter().any(|c| LESSON_CLASS_RE.is_match(c)) {
                    if let Some((event, homework_id)) = parse_lesson_cell(
                        cell,
                        &classes,
                        day_en,
                        &date_part,
                        resolution_year,
                        teacher_map,
                        column,
                        colspan,
                    ) {
                        if let Some(id) = homework_id {
                            homework_ids.push(id);
                        }
                        events.push(event);
                    }
                }
            }
            column += colspan;
        }
    }

    // Known degraded layout: the table renders empty but the student info
    // cell carries the whole week as prose. Best effort only.
    if events.is_empty() {
        if let Some(text) = &student_text {
            if FALLBACK_DAY_RE.is_match(text) {
                events = fallback_events_from_text(text, resolution_year, teacher_map);
                if !events.is_empty() {
                    warn!(
                        "week {offset}: recovered {} events from degraded layout",
                        events.len()
                    );
                }
            }
        }
    }

    Some(WeekParse {
        student_info,
        week_info,
        events,
        homework_ids,
    })
}

fn parse_week_info(doc: &Html, html: &str, offset: i32, fallback_year: i32) -> WeekInfo {
    let week_number = doc
        .select(&WEEK_LINK_SEL)
        .next()
        .map(|link| collapsed_text(link))
        .and_then(|text| text.strip_prefix("Vika ")?.trim().parse::<u32>().ok());

    let (start_date, end_date) = match DATE_RANGE_RE.captures(html) {
        Some(captures) => (
            to_iso_date(&captures[1], 0),
            to_iso_date(&captures[2], 0),
        ),
        None => (None, None),
    };
    // The ISO start date decides the year; the current year is the last
    // resort when the page carries no date range at all.
    let year = start_date
        .as_deref()
        .and_then(|iso| iso[..4].parse::<i32>().ok())
        .unwrap_or(fallback_year);

    WeekInfo {
        week_number,
        start_date,
        end_date,
        year: Some(year),
        offset: Some(offset),
        week_key: None,
    }
}

/// Returns the parsed student info plus the full text of the cell that held
/// it; the latter feeds the degraded-layout fallback.
fn parse_student_info(doc: &Html) -> (Option<StudentInfo>, Option<String>) {
    let Some(cell) = doc
        .select(&TD_SEL)
        .find(|td| td.text().any(|t| t.contains(STUDENT_INFO_MARKER)))
    else {
        return (None, None);
    };
    let full_text = collapsed_text(cell);
    // Only the prefix before the nested timetable table belongs to the
    // student info line.
    let prefix = text_before_nested_table(cell);

    let info = match STUDENT_INFO_RE.captures(&prefix) {
        // The class capture can drag trailing prose along in degraded
        // layouts; the class itself is always a single token like `22y`.
        Some(captures) => Some(StudentInfo {
            student_name: captures[1].trim().to_string(),
            student_class: captures[2]
                .split_whitespace()
                .next()
                .unwrap_or("")
                .to_string(),
        }),
        None => student_info_from_split(&prefix),
    };
    if info.is_none() {
        warn!("student info line did not match: {prefix:?}");
    }
    (info, Some(full_text))
}

fn student_info_from_split(prefix: &str) -> Option<StudentInfo> {
    let (_, rest) = prefix.split_once(':')?;
    let (name, class) = rest.split_once(',')?;
    let name = name.trim();
    let class = class.trim();
    if name.is_empty() || class.is_empty() {
        return None;
    }
    Some(StudentInfo {
        student_name: name.to_string(),
        student_class: class.to_string(),
    })
}

#[allow(clippy::too_many_arguments)]
fn parse_lesson_cell(
    cell: &ElementRef,
    classes: &[&str],
    day_en: &str,
    date_part: &str,
    year: i32,
    teacher_map: &HashMap<String, String>,
    start_column: u32,
    colspan: u32,
) -> Option<(Event, Option<String>)> {
    let anchors: Vec<ElementRef> = cell.select(&A_SEL).collect();
    if anchors.len() < 3 {
        warn!(
            "lesson cell with only {} links skipped ({day_en} {date_part})",
            anchors.len()
        );
        return None;
    }

    let code_raw = collapsed_text(anchors[0]);
    let teacher_short = collapsed_text(anchors[1]);
    let room_raw = collapsed_text(anchors[2]);

    let (title, level, year_code) = split_subject_code(&code_raw);
    let location = room_raw
        .strip_prefix("st.")
        .unwrap_or(&room_raw)
        .trim()
        .to_string();
    let teacher = resolve_teacher(teacher_map, &teacher_short);
    let cancelled = classes.iter().any(|c| CANCELLED_CLASSES.contains(c));

    let (time_slot, time_range) = if colspan >= 90 {
        ("All day".to_string(), "08:10-15:25".to_string())
    } else {
        timeslot_for_column(start_column)
    };
    let (start_time, end_time) = parse_time_range(&time_range);

    let lesson_id = cell.select(&LESSON_SPAN_SEL).next().and_then(|span| {
        let id = span.value().attr("id")?;
        let inner = id.strip_prefix("MyWindow")?.strip_suffix("Main")?;
        if inner.is_empty() {
            None
        } else {
            Some(inner.to_string())
        }
    });
    if lesson_id.is_none() {
        debug!("no lesson id span for {title} on {day_en} {date_part}");
    }

    let has_homework_note = cell.select(&NOTE_INPUT_SEL).next().is_some();
    let homework_id = if has_homework_note {
        lesson_id.clone()
    } else {
        None
    };

    let event = Event {
        title,
        level,
        year: format_academic_year(&year_code),
        date: to_iso_date(date_part, year),
        day_of_week: day_en.to_string(),
        teacher,
        teacher_short,
        location,
        time_slot,
        start_time,
        end_time,
        time_range,
        cancelled,
        lesson_id,
        has_homework_note,
        description: None,
    };
    Some((event, homework_id))
}

/// Splits the raw subject code anchor text into (title, level, year code).
fn split_subject_code(raw: &str) -> (String, String, String) {
    let parts: Vec<&str> = raw.split('-').collect();
    if parts[0] == "Várroynd" && parts.len() >= 5 {
        (
            format!("{}-{}", parts[0], parts[1]),
            parts[2].to_string(),
            parts[4].to_string(),
        )
    } else if parts.len() >= 4 {
        (
            parts[0].to_string(),
            parts[1].to_string(),
            parts[3].to_string(),
        )
    } else {
        (raw.to_string(), String::new(), String::new())
    }
}

/// Full teacher name for the initials, falling back to the initials
/// themselves. An embedded `( XX )` initials annotation is dropped.
fn resolve_teacher(teacher_map: &HashMap<String, String>, initials: &str) -> String {
    let full = teacher_map
        .get(initials)
        .cloned()
        .unwrap_or_else(|| initials.to_string());
    match full.split_once(" (") {
        Some((head, _)) => head.trim_end().to_string(),
        None => full,
    }
}

/// Time slot and range for a 1-based starting column in the timetable grid.
fn timeslot_for_column(column: u32) -> (String, String) {
    let (slot, range) = match column {
        2..=25 => ("1", "08:10-09:40"),
        26..=50 => ("2", "10:05-11:35"),
        51..=71 => ("3", "12:10-13:40"),
        72..=90 => ("4", "13:55-15:25"),
        91..=111 => ("5", "15:30-17:00"),
        112..=131 => ("6", "17:15-18:45"),
        _ => ("N/A", "N/A"),
    };
    (slot.to_string(), range.to_string())
}

fn day_name_to_english(day: &str) -> &str {
    match day {
        "Mánadagur" => "Monday",
        "Týsdagur" => "Tuesday",
        "Mikudagur" => "Wednesday",
        "Hósdagur" => "Thursday",
        "Fríggjadagur" => "Friday",
        "Leygardagur" => "Saturday",
        "Sunnudagur" => "Sunday",
        other => other,
    }
}

fn has_no_lessons_message(doc: &Html) -> bool {
    doc.select(&NO_LESSONS_SCOPE_SEL).any(|el| {
        let text = collapsed_text(el).to_lowercase();
        NO_LESSONS_PHRASES.iter().any(|phrase| text.contains(phrase))
    })
}

/// Best-effort extraction for the degraded layout where the week renders as
/// prose inside the student info cell instead of table cells.
fn fallback_events_from_text(
    text: &str,
    year: i32,
    teacher_map: &HashMap<String, String>,
) -> Vec<Event> {
    let markers: Vec<(usize, String, String)> = FALLBACK_DAY_RE
        .captures_iter(text)
        .filter_map(|captures| {
            let m = captures.get(0)?;
            Some((m.start(), captures[1].to_string(), captures[2].to_string()))
        })
        .collect();

    let mut events = Vec::new();
    for (index, (start, day_fo, date_part)) in markers.iter().enumerate() {
        let end = markers
            .get(index + 1)
            .map(|next| next.0)
            .unwrap_or(text.len());
        let segment = &text[*start..end];
        for captures in FALLBACK_EVENT_RE.captures_iter(segment) {
            let code_raw = &captures[1];
            let teacher_short = captures[2].to_string();
            let room = captures[3].to_string();
            let (title, level, year_code) = split_subject_code(code_raw);
            events.push(Event {
                title,
                level,
                year: format_academic_year(&year_code),
                date: to_iso_date(date_part, year),
                day_of_week: day_name_to_english(day_fo).to_string(),
                teacher: resolve_teacher(teacher_map, &teacher_short),
                teacher_short,
                location: room,
                time_slot: "N/A".to_string(),
                start_time: None,
                end_time: None,
                time_range: "N/A".to_string(),
                cancelled: false,
                lesson_id: None,
                has_homework_note: false,
                description: None,
            });
        }
    }
    events
}

/// Parses a homework response into at most one `(lesson_id, markdown)` pair.
pub fn parse_homework_html(html: &str) -> Option<(String, String)> {
    let doc = Html::parse_document(html);

    let lesson_id = doc
        .select(&LESSON_ID_INPUT_SEL)
        .next()
        .and_then(|input| input.value().attr("value"))
        .map(str::trim)
        .filter(|v| !v.is_empty())?
        .to_string();

    let header = doc
        .select(&B_SEL)
        .find(|b| collapsed_text(*b) == "Heimaarbeiði")?;
    let block = header
        .ancestors()
        .filter_map(ElementRef::wrap)
        .find(|el| el.value().name() == "p")?;

    let markdown = homework_block_to_markdown(block);
    if markdown.is_empty() {
        None
    } else {
        Some((lesson_id, markdown))
    }
}

/// Renders the homework block as Markdown, dropping the `Heimaarbeiði`
/// header and the first `<br>` after it at the top level.
fn homework_block_to_markdown(block: ElementRef) -> String {
    let mut out = String::new();
    let mut header_skipped = false;
    let mut first_br_skipped = false;

    for child in block.children() {
        if let Some(el) = ElementRef::wrap(child) {
            let name = el.value().name();
            if !header_skipped && name == "b" && collapsed_text(el) == "Heimaarbeiði" {
                header_skipped = true;
                continue;
            }
            if header_skipped && !first_br_skipped && name == "br" {
                first_br_skipped = true;
                continue;
            }
        }
        render_markdown_node(child, &mut out);
    }

    let cleaned = SPACE_BEFORE_NEWLINE_RE.replace_all(&out, "\n");
    let cleaned = SPACE_AFTER_NEWLINE_RE.replace_all(&cleaned, "\n");
    cleaned.trim().to_string()
}

fn render_markdown_node(node: NodeRef<'_, Node>, out: &mut String) {
    match node.value() {
        Node::Text(text) => out.push_str(&text.text),
        Node::Element(element) => match element.name() {
            "br" => out.push('\n'),
            "b" => {
                let inner = render_markdown_children(node);
                let inner = inner.trim();
                if !inner.is_empty() {
                    out.push_str("**");
                    out.push_str(inner);
                    out.push_str("**");
                }
            }
            "i" => {
                let inner = render_markdown_children(node);
                let inner = inner.trim();
                if !inner.is_empty() {
                    out.push('*');
                    out.push_str(inner);
                    out.push('*');
                }
            }
            _ => {
                for child in node.children() {
                    render_markdown_node(child, out);
                }
            }
        },
        _ => {}
    }
}

fn render_markdown_children(node: NodeRef<'_, Node>) -> String {
    let mut out = String::new();
    for child in node.children() {
        render_markdown_node(child, &mut out);
    }
    out
}

/// Parses the teacher list into an initials → full name map.
///
/// The `<select>` options win; the regex scans only run when the select
/// yields nothing.
pub fn parse_teacher_html(html: &str) -> HashMap<String, String> {
    let doc = Html::parse_document(html);
    let mut map = HashMap::new();

    if let Some(select) = doc.select(&SELECT_SEL).next() {
        for option in select.select(&OPTION_SEL) {
            let initials = option.value().attr("value").unwrap_or("").trim();
            let name = collapsed_text(option);
            if !initials.is_empty() && initials != "-1" && !name.is_empty() {
                map.insert(initials.to_string(), name);
            }
        }
    }

    if map.is_empty() {
        for pattern in [&*TEACHER_WITH_LINK_RE, &*TEACHER_NO_LINK_RE] {
            for captures in pattern.captures_iter(html) {
                let name = captures[1].trim().to_string();
                let initials = captures[2].trim().to_string();
                if !initials.is_empty() && !name.is_empty() {
                    map.entry(initials).or_insert(name);
                }
            }
        }
    }

    if map.is_empty() {
        warn!("no teachers parsed from teacher list response");
    }
    map
}

/// Parses the available week offsets from navigation `onclick` handlers.
pub fn parse_available_offsets(html: &str) -> Vec<i32> {
    let doc = Html::parse_document(html);
    let mut offsets: Vec<i32> = doc
        .select(&NAV_LINK_SEL)
        .filter_map(|link| {
            let onclick = link.value().attr("onclick")?;
            WEEK_OFFSET_RE
                .captures(onclick)
                .and_then(|captures| captures[1].parse().ok())
        })
        .collect();
    offsets.sort_unstable();
    offsets.dedup();
    offsets
}

/// Sets each event's description from the homework map, keyed by lesson id.
pub fn merge_homework(events: &mut [Event], homework: &HashMap<String, String>) {
    if homework.is_empty() {
        return;
    }
    let mut merged = 0;
    for event in events.iter_mut() {
        if let Some(id) = &event.lesson_id {
            if let Some(text) = homework.get(id) {
                event.description = Some(text.clone());
                merged += 1;
            }
        }
    }
    debug!("merged homework into {merged} events");
}

fn collapsed_text(el: ElementRef) -> String {
    let mut out = String::new();
    for piece in el.text() {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(piece);
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn text_before_nested_table(el: ElementRef) -> String {
    let mut out = String::new();
    collect_text_until_table(*el, &mut out);
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn collect_text_until_table(node: NodeRef<'_, Node>, out: &mut String) -> bool {
    for child in node.children() {
        match child.value() {
            Node::Text(text) => {
                out.push_str(&text.text);
                out.push(' ');
            }
            Node::Element(element) => {
                if element.name() == "table" {
                    return false;
                }
                if !collect_text_until_table(child, out) {
                    return false;
                }
            }
            _ => {}
        }
    }
    true
}

fn has_any_class(el: &ElementRef, names: &[&str]) -> bool {
    el.value().classes().any(|class| names.contains(&class))
}
