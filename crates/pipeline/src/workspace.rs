//! Local job directories and result object naming.
//!
//! Each job gets `<data_dir>/<job_id>/` holding the downloaded input
//! (`<job_id>.vcf`), the task description (`task.json`), the task's own log
//! (`<job_id>.vcf.log`) and the engine outputs (`<job_id>.annot.vcf`,
//! `<job_id>.vcf.count.log`).

use std::path::{Path, PathBuf};

use gas_core::{FileRef, JobId, UserId};

#[derive(Debug, Clone)]
pub struct JobWorkspace {
    data_dir: PathBuf,
}

impl JobWorkspace {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn paths(&self, job_id: JobId) -> JobPaths {
        let dir = self.data_dir.join(job_id.to_string());
        JobPaths {
            input: dir.join(format!("{job_id}.vcf")),
            task_file: dir.join("task.json"),
            task_log: dir.join(format!("{job_id}.vcf.log")),
            dir,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPaths {
    pub dir: PathBuf,
    pub input: PathBuf,
    pub task_file: PathBuf,
    pub task_log: PathBuf,
}

/// Object name stem of an uploaded file: everything before the first `.`.
pub fn object_stem(input_file_name: &str) -> &str {
    input_file_name.split('.').next().unwrap_or(input_file_name)
}

/// Where the result and log of a job are stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultObjects {
    pub result: FileRef,
    pub log: FileRef,
}

impl ResultObjects {
    /// `<prefix>/<user>/<job>/<stem>.annot.vcf` and `.vcf.count.log` in `bucket`.
    pub fn new(bucket: &str, key_prefix: &str, user_id: &UserId, job_id: JobId, input_file_name: &str) -> Self {
        let stem = object_stem(input_file_name);
        let base = format!("{key_prefix}/{user_id}/{job_id}/{stem}");
        Self {
            result: FileRef::new(bucket, format!("{base}.annot.vcf")),
            log: FileRef::new(bucket, format!("{base}.vcf.count.log")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_files_live_in_a_per_job_directory() {
        let job_id = JobId::new();
        let paths = JobWorkspace::new("/data").paths(job_id);
        assert_eq!(paths.dir, PathBuf::from(format!("/data/{job_id}")));
        assert_eq!(paths.input, paths.dir.join(format!("{job_id}.vcf")));
        assert_eq!(paths.task_log, paths.dir.join(format!("{job_id}.vcf.log")));
    }

    #[test]
    fn result_keys_use_the_stem_of_the_uploaded_name() {
        let job_id = JobId::new();
        let user = UserId::new("u1").unwrap();
        let objects = ResultObjects::new("results", "cnet", &user, job_id, "sample.free.vcf");

        assert_eq!(objects.result.key, format!("cnet/u1/{job_id}/sample.annot.vcf"));
        assert_eq!(objects.log.key, format!("cnet/u1/{job_id}/sample.vcf.count.log"));
        assert_eq!(objects.result.bucket, "results");
        assert_eq!(object_stem("noext"), "noext");
    }
}
