use shared::types::StatusMessage;

/// Merge `next` over `previous`.
///
/// Fields missing from `next` are carried over so that a partial update
/// never turns known state back into unknown. An empty temperature list counts
/// as missing. Logs and server time belong to a single message and are never
/// carried over.
pub fn merge(previous: Option<&StatusMessage>, next: StatusMessage) -> StatusMessage {
    let Some(previous) = previous else {
        return next;
    };

    StatusMessage {
        state: next.state.or_else(|| previous.state.clone()),
        temps: if next.temps.is_empty() {
            previous.temps.clone()
        } else {
            next.temps
        },
        progress: next.progress.or_else(|| previous.progress.clone()),
        job: next.job.or_else(|| previous.job.clone()),
        logs: next.logs,
        server_time: next.server_time,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::types::{JobInfo, JobProgress, PrinterState, TemperatureReading};

    fn full_message() -> StatusMessage {
        StatusMessage {
            state: Some(PrinterState {
                text: "Printing".to_string(),
                operational: true,
                printing: true,
                paused: false,
                error: false,
            }),
            temps: vec![TemperatureReading {
                component: "tool0".to_string(),
                actual: 214.8,
                target: Some(215.0),
            }],
            progress: Some(JobProgress {
                completion: Some(42.0),
                print_time_secs: Some(1200),
                print_time_left_secs: Some(1650),
            }),
            job: Some(JobInfo {
                file_name: Some("benchy.gcode".to_string()),
                estimated_print_time_secs: Some(2850),
            }),
            logs: vec!["Send: M105".to_string()],
            server_time: Some(1_700_000_000.0),
        }
    }

    #[test]
    fn test_first_message_passes_through() {
        let message = full_message();
        assert_eq!(merge(None, message.clone()), message);
    }

    #[test]
    fn test_missing_fields_inherited() {
        let previous = full_message();
        let merged = merge(Some(&previous), StatusMessage::default());

        assert_eq!(merged.state, previous.state);
        assert_eq!(merged.temps, previous.temps);
        assert_eq!(merged.progress, previous.progress);
        assert_eq!(merged.job, previous.job);
    }

    #[test]
    fn test_logs_and_server_time_not_inherited() {
        let previous = full_message();
        let merged = merge(Some(&previous), StatusMessage::default());

        assert!(merged.logs.is_empty());
        assert_eq!(merged.server_time, None);
    }

    #[test]
    fn test_present_fields_replace_previous() {
        let previous = full_message();
        let mut next = StatusMessage::default();
        next.temps = vec![TemperatureReading {
            component: "bed".to_string(),
            actual: 60.1,
            target: Some(60.0),
        }];
        next.progress = Some(JobProgress {
            completion: Some(43.0),
            print_time_secs: Some(1230),
            print_time_left_secs: Some(1620),
        });

        let merged = merge(Some(&previous), next.clone());
        assert_eq!(merged.temps, next.temps);
        assert_eq!(merged.progress, next.progress);
        assert_eq!(merged.state, previous.state);
    }
}
