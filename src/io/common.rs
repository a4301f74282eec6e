use super::{Record, WriteError};

/// Encode a batch of records to a buffer.
///
/// Records become newline-delimited rows. Encoding the whole batch to
/// memory first means a failing record hands nothing to the file.
pub(crate) fn encode_batch<R: Record>(records: &[R]) -> Result<Vec<u8>, WriteError> {
    let mut buffer = Vec::new();

    for record in records {
        record.encode(&mut buffer)?;
        buffer.push(b'\n');
    }

    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::DailyCount;
    use crate::store::{MetricsBucket, VersionId};

    #[test]
    fn one_line_per_record() {
        let rows = vec![
            DailyCount::new("org1", "participant", "2020-01-01".parse().unwrap(), 1),
            DailyCount::new("org2", "participant", "2020-01-01".parse().unwrap(), 3),
        ];

        let buffer = encode_batch(&rows).unwrap();
        let text = String::from_utf8(buffer).unwrap();

        assert_eq!(text.matches('\n').count(), 2);
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn newlines_in_json_values_are_escaped() {
        let bucket = MetricsBucket::new(
            VersionId(7),
            "line 1\nline 2",
            "2020-01-01".parse().unwrap(),
            [("participant".to_string(), 1)].into(),
        );

        let buffer = encode_batch(&[bucket]).unwrap();
        let text = String::from_utf8(buffer).unwrap();

        // Exactly one newline: the delimiter.
        assert_eq!(text.matches('\n').count(), 1);
        assert!(text.contains("\\n"));
    }
}
