//! CSV report of reportable tracks

use crate::registry::TrackOccurrence;
use std::io::Write;

pub const REPORT_HEADER: [&str; 6] = [
    "TrackId",
    "StartTime",
    "EndTime",
    "Duration",
    "ClassName",
    "AvgConfidence",
];

/// Write the header and one row per reportable occurrence
///
/// The header is written even when no track qualifies.
pub fn write_report<'a, W, I>(writer: W, occurrences: I) -> Result<usize, csv::Error>
where
    W: Write,
    I: IntoIterator<Item = &'a TrackOccurrence>,
{
    let mut csv_writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(writer);
    csv_writer.write_record(REPORT_HEADER)?;

    let mut rows = 0;
    for occurrence in occurrences.into_iter().filter(|o| o.is_reportable()) {
        csv_writer.write_record([
            occurrence.track_id.to_string(),
            format!("{:.2}", occurrence.start_time),
            format!("{:.2}", occurrence.end_time),
            format!("{:.2}", occurrence.duration()),
            occurrence.class_label.clone(),
            format!("{:.4}", occurrence.mean_confidence()),
        ])?;
        rows += 1;
    }

    csv_writer.flush()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn occurrence(track_id: u32, class_label: &str, start: u64, end: u64, fps: f64) -> TrackOccurrence {
        TrackOccurrence {
            track_id,
            class_label: class_label.to_string(),
            start_frame: start,
            start_time: start as f64 / fps,
            end_frame: end,
            end_time: end as f64 / fps,
            confidence_samples: vec![0.9, 0.8],
            clip_path: PathBuf::from(format!("{track_id}.mp4")),
        }
    }

    #[test]
    fn test_empty_report_has_header() {
        let mut out = Vec::new();
        let rows = write_report(&mut out, std::iter::empty()).unwrap();
        assert_eq!(rows, 0);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "TrackId,StartTime,EndTime,Duration,ClassName,AvgConfidence\n"
        );
    }

    #[test]
    fn test_report_rows_and_exclusion() {
        let tracks = vec![
            occurrence(7, "logo", 0, 60, 30.0),
            occurrence(8, "logo", 15, 15, 30.0),
        ];
        let mut out = Vec::new();
        let rows = write_report(&mut out, &tracks).unwrap();
        assert_eq!(rows, 1);

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1], "7,0.00,2.00,2.00,logo,0.8500");
    }

    #[test]
    fn test_class_name_with_comma_is_quoted() {
        let tracks = vec![occurrence(1, "traffic light, red", 0, 30, 30.0)];
        let mut out = Vec::new();
        write_report(&mut out, &tracks).unwrap();
        assert!(String::from_utf8(out)
            .unwrap()
            .contains("\"traffic light, red\""));
    }
}
