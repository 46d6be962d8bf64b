//! Canonical timetable data model, format version 2.
//!
//! Field names are camelCase on the wire; optional fields are omitted when
//! absent. Unknown inbound fields are ignored.

use serde::{Deserialize, Serialize};

pub const FORMAT_VERSION: u32 = 2;

fn default_format_version() -> u32 {
    FORMAT_VERSION
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentInfo {
    pub student_name: String,
    #[serde(rename = "class")]
    pub student_class: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeekInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub week_number: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<i32>,
    /// Computed `YYYY-Www` key; filled in during validation when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub week_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Subject code, e.g. `søg`.
    pub title: String,
    pub level: String,
    /// Academic year, e.g. `2024-2025`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    pub day_of_week: String,
    /// Full teacher name; identical to the initials when unknown.
    pub teacher: String,
    pub teacher_short: String,
    pub location: String,
    /// `"1"`..`"6"`, `"All day"`, or `"N/A"`.
    pub time_slot: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    pub time_range: String,
    pub cancelled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lesson_id: Option<String>,
    /// Homework Markdown, merged in after the homework fan-out.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub has_homework_note: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimetableData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub student_info: Option<StudentInfo>,
    pub week_info: WeekInfo,
    pub events: Vec<Event>,
    #[serde(default = "default_format_version")]
    pub format_version: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lesson_serializes_with_camel_case_keys_and_omits_absent_fields() {
        let event = Event {
            title: "søg".into(),
            level: "A".into(),
            year: Some("2024-2025".into()),
            date: Some("2025-03-24".into()),
            day_of_week: "Monday".into(),
            teacher: "Brynjálvur I. Johansen".into(),
            teacher_short: "BIJ".into(),
            location: "608".into(),
            time_slot: "1".into(),
            start_time: Some("08:10".into()),
            end_time: Some("09:40".into()),
            time_range: "08:10-09:40".into(),
            cancelled: false,
            lesson_id: None,
            description: None,
            has_homework_note: false,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["dayOfWeek"], "Monday");
        assert_eq!(json["teacherShort"], "BIJ");
        assert_eq!(json["timeSlot"], "1");
        assert_eq!(json["hasHomeworkNote"], false);
        assert!(json.get("lessonId").is_none());
        assert!(json.get("description").is_none());
    }

    #[test]
    fn unknown_fields_are_ignored_on_input() {
        let json = r#"{
            "studentInfo": {"studentName": "X", "class": "22y", "extra": 1},
            "weekInfo": {"weekNumber": 13, "year": 2025, "surprise": true},
            "events": [],
            "formatVersion": 2,
            "futureField": "ignored"
        }"#;
        let data: TimetableData = serde_json::from_str(json).unwrap();
        assert_eq!(data.week_info.week_number, Some(13));
        assert_eq!(
            data.student_info.unwrap().student_class,
            "22y".to_string()
        );
    }

    #[test]
    fn format_version_defaults_to_two() {
        let json = r#"{"weekInfo": {}, "events": []}"#;
        let data: TimetableData = serde_json::from_str(json).unwrap();
        assert_eq!(data.format_version, FORMAT_VERSION);
    }
}
