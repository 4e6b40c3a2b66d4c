use serde::{Deserialize, Serialize};
use std::str::FromStr;
use utoipa::ToSchema;

/// Predefined background tasks that can be triggered on demand via
/// `POST /tasks/trigger`. Concrete task logic lives in the application
/// layer; this enum only needs to agree with whatever name the application
/// registered in the `HandlerRegistry` (see `taskloop-worker`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TaskName {
    BackupDatabase,
    CheckDueReminders,
    WarmCache,
    InvalidateCache,
    ExportCsv,
    ExportJson,
    CleanupTempFiles,
    CleanupOldBackups,
    CleanupOldExports,
    CleanupExpiredData,
    RunAllCleanup,
}

impl TaskName {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskName::BackupDatabase => "backup_database",
            TaskName::CheckDueReminders => "check_due_reminders",
            TaskName::WarmCache => "warm_cache",
            TaskName::InvalidateCache => "invalidate_cache",
            TaskName::ExportCsv => "export_csv",
            TaskName::ExportJson => "export_json",
            TaskName::CleanupTempFiles => "cleanup_temp_files",
            TaskName::CleanupOldBackups => "cleanup_old_backups",
            TaskName::CleanupOldExports => "cleanup_old_exports",
            TaskName::CleanupExpiredData => "cleanup_expired_data",
            TaskName::RunAllCleanup => "run_all_cleanup",
        }
    }
}

impl std::fmt::Display for TaskName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "backup_database" => Ok(TaskName::BackupDatabase),
            "check_due_reminders" => Ok(TaskName::CheckDueReminders),
            "warm_cache" => Ok(TaskName::WarmCache),
            "invalidate_cache" => Ok(TaskName::InvalidateCache),
            "export_csv" => Ok(TaskName::ExportCsv),
            "export_json" => Ok(TaskName::ExportJson),
            "cleanup_temp_files" => Ok(TaskName::CleanupTempFiles),
            "cleanup_old_backups" => Ok(TaskName::CleanupOldBackups),
            "cleanup_old_exports" => Ok(TaskName::CleanupOldExports),
            "cleanup_expired_data" => Ok(TaskName::CleanupExpiredData),
            "run_all_cleanup" => Ok(TaskName::RunAllCleanup),
            other => Err(format!("unknown task name: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [TaskName; 11] = [
        TaskName::BackupDatabase,
        TaskName::CheckDueReminders,
        TaskName::WarmCache,
        TaskName::InvalidateCache,
        TaskName::ExportCsv,
        TaskName::ExportJson,
        TaskName::CleanupTempFiles,
        TaskName::CleanupOldBackups,
        TaskName::CleanupOldExports,
        TaskName::CleanupExpiredData,
        TaskName::RunAllCleanup,
    ];

    #[test]
    fn every_variant_round_trips_through_as_str_and_from_str() {
        for name in ALL {
            assert_eq!(name.as_str().parse::<TaskName>().unwrap(), name);
            assert_eq!(name.to_string(), name.as_str());
        }
    }

    #[test]
    fn unknown_name_is_rejected() {
        assert!("does_not_exist".parse::<TaskName>().is_err());
    }
}
