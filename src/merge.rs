use crate::error::MapmergeError;
use crate::lot::{Format, MERGE_FORMAT, Wafer, Wafermap};
use crate::store::ContentStoreLike;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;
use tracing::{debug, info};
use uuid::Uuid;

/// Runs the external merge tool for one wafer and folds the produced maps
/// back into the wafer's wafermap list.
pub struct MergeTool {
    tool_path: PathBuf,
    scratch_dir: Option<PathBuf>,
}

impl MergeTool {
    pub fn new(tool_path: impl Into<PathBuf>) -> Self {
        MergeTool {
            tool_path: tool_path.into(),
            scratch_dir: None,
        }
    }

    /// Create the per-invocation temp directories under `dir` instead of the
    /// system default.
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = Some(dir.into());
        self
    }

    fn tempdir(&self, suffix: &str) -> Result<TempDir, MapmergeError> {
        let builder = {
            let mut b = tempfile::Builder::new();
            b.prefix("mapmerge-").suffix(suffix);
            b
        };
        let dir = match &self.scratch_dir {
            Some(root) => builder.tempdir_in(root)?,
            None => builder.tempdir()?,
        };
        Ok(dir)
    }

    /// Merge one wafer: materialize every th01 wafermap into a fresh input
    /// directory, run the tool, and append one new inline th01 wafermap per
    /// file the tool leaves in the output directory.
    ///
    /// Both directories are removed on every exit path; a datastore miss
    /// while resolving payloads means the tool is never spawned.
    pub fn merge_wafer<S: ContentStoreLike>(
        &self,
        lot_name: &str,
        process_step: &str,
        wafer: &mut Wafer,
        store: &S,
    ) -> Result<(), MapmergeError> {
        let input_dir = self.tempdir("input")?;
        let output_dir = self.tempdir("output")?;
        debug!(
            input = %input_dir.path().display(),
            output = %output_dir.path().display(),
            wafer = %wafer.number,
            "created merge scratch directories"
        );

        for wafermap in &wafer.wafermaps {
            let Some(format) = wafermap.format(MERGE_FORMAT) else {
                continue;
            };
            let payload = match format {
                Format::Inline(bytes) => bytes.clone(),
                Format::Referenced(reference) => store.get(reference)?,
            };
            // The wafermap display name is not trusted as a filename.
            let filename = Uuid::new_v4().simple().to_string();
            fs::write(input_dir.path().join(&filename), &payload)?;
            debug!(wafermap = %wafermap.name, file = %filename, "materialized wafermap payload");
        }

        let output = Command::new(&self.tool_path)
            .arg(format!("lot={}", lot_name))
            .arg(format!("wafer={}", wafer.number))
            .arg(format!("ProcessStep={}", process_step))
            .arg("noDB")
            .arg(format!("localFolder={}", input_dir.path().display()))
            .arg(format!("DestinationDir={}", output_dir.path().display()))
            .output()?;

        if !output.status.success() {
            return Err(MapmergeError::MergeFailed {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        let produced = collect_files(output_dir.path())?;
        info!(
            wafer = %wafer.number,
            produced = produced.len(),
            "merge tool finished"
        );
        for path in produced {
            let contents = fs::read(&path)?;
            let mut wafermap =
                Wafermap::new(format!("postprocessing-{}", Uuid::new_v4().simple()));
            wafermap.set_format(MERGE_FORMAT, Format::Inline(contents));
            wafer.wafermaps.push(wafermap);
        }
        Ok(())
    }
}

/// Plain files in `dir`, sorted by name so results fold in a stable order.
fn collect_files(dir: &Path) -> Result<Vec<PathBuf>, MapmergeError> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MockStore;
    use std::os::unix::fs::PermissionsExt;

    fn stub_tool(dir: &Path, script: &str) -> PathBuf {
        let path = dir.join("stub-merge.sh");
        fs::write(&path, script).expect("failed to write stub tool");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
            .expect("failed to chmod stub tool");
        path
    }

    /// Stub that records its arguments and writes two result maps.
    fn producing_tool(args_file: &Path) -> String {
        format!(
            r#"#!/bin/sh
out=""
for arg in "$@"; do
  case "$arg" in
    DestinationDir=*) out="${{arg#DestinationDir=}}" ;;
  esac
  echo "$arg" >> "{}"
done
printf 'MERGED-A' > "$out/result-a"
printf 'MERGED-B' > "$out/result-b"
exit 0
"#,
            args_file.display()
        )
    }

    const FAILING_TOOL: &str = r#"#!/bin/sh
printf 'bad input' >&2
exit 2
"#;

    fn wafer_with_reference(reference: &str) -> Wafer {
        let mut wafer = Wafer::new("1", "100");
        let mut wafermap = Wafermap::new("blaat");
        wafermap.set_format(MERGE_FORMAT, Format::Referenced(reference.to_string()));
        wafer.wafermaps.push(wafermap);
        wafer
    }

    #[test]
    fn test_merge_appends_one_wafermap_per_output_file() {
        let scratch = tempfile::tempdir().unwrap();
        let args_file = scratch.path().join("args.txt");
        let tool = stub_tool(scratch.path(), &producing_tool(&args_file));

        let store = MockStore::new();
        store.insert("deadbeef", b"WMAP....");
        let mut wafer = wafer_with_reference("deadbeef");

        let merge = MergeTool::new(&tool);
        merge
            .merge_wafer("M31265", "pactech", &mut wafer, &store)
            .expect("merge failed");

        assert_eq!(wafer.wafermaps.len(), 3);
        let new_maps = &wafer.wafermaps[1..];
        assert_eq!(
            new_maps[0].format(MERGE_FORMAT),
            Some(&Format::Inline(b"MERGED-A".to_vec()))
        );
        assert_eq!(
            new_maps[1].format(MERGE_FORMAT),
            Some(&Format::Inline(b"MERGED-B".to_vec()))
        );
        assert_ne!(new_maps[0].name, new_maps[1].name);

        let args = fs::read_to_string(&args_file).unwrap();
        assert!(args.contains("lot=M31265"));
        assert!(args.contains("wafer=1"));
        assert!(args.contains("ProcessStep=pactech"));
        assert!(args.contains("noDB"));
        assert!(args.contains("localFolder="));
        assert!(args.contains("DestinationDir="));
    }

    #[test]
    fn test_merge_failure_reports_exit_code_and_streams() {
        let scratch = tempfile::tempdir().unwrap();
        let tool = stub_tool(scratch.path(), FAILING_TOOL);

        let store = MockStore::new();
        store.insert("deadbeef", b"WMAP....");
        let mut wafer = wafer_with_reference("deadbeef");

        let merge = MergeTool::new(&tool);
        match merge
            .merge_wafer("M31265", "pactech", &mut wafer, &store)
            .unwrap_err()
        {
            MapmergeError::MergeFailed {
                exit_code,
                stdout,
                stderr,
            } => {
                assert_eq!(exit_code, 2);
                assert_eq!(stdout, "");
                assert_eq!(stderr, "bad input");
            }
            other => panic!("expected MergeFailed, got {:?}", other),
        }
        // The failed run must not have grown the wafer.
        assert_eq!(wafer.wafermaps.len(), 1);
    }

    #[test]
    fn test_missing_reference_prevents_tool_invocation() {
        let scratch = tempfile::tempdir().unwrap();
        let marker = scratch.path().join("invoked");
        let script = format!("#!/bin/sh\ntouch {}\nexit 0\n", marker.display());
        let tool = stub_tool(scratch.path(), &script);

        let store = MockStore::new(); // empty: every get misses
        let mut wafer = wafer_with_reference("deadbeef");

        let merge = MergeTool::new(&tool);
        let err = merge
            .merge_wafer("M31265", "pactech", &mut wafer, &store)
            .unwrap_err();
        assert_eq!(err.kind(), "reference-not-found");
        assert!(!marker.exists(), "tool must not run after a datastore miss");
    }

    #[test]
    fn test_scratch_directories_are_removed_on_failure() {
        let scratch = tempfile::tempdir().unwrap();
        let tool = stub_tool(scratch.path(), FAILING_TOOL);
        let dirs = scratch.path().join("dirs");
        fs::create_dir(&dirs).unwrap();

        let store = MockStore::new();
        store.insert("deadbeef", b"WMAP....");
        let mut wafer = wafer_with_reference("deadbeef");

        let merge = MergeTool::new(&tool).with_scratch_dir(&dirs);
        assert!(
            merge
                .merge_wafer("M31265", "pactech", &mut wafer, &store)
                .is_err()
        );
        assert_eq!(fs::read_dir(&dirs).unwrap().count(), 0);
    }

    #[test]
    fn test_scratch_directories_are_removed_after_store_miss() {
        let scratch = tempfile::tempdir().unwrap();
        let tool = stub_tool(scratch.path(), FAILING_TOOL);
        let dirs = scratch.path().join("dirs");
        fs::create_dir(&dirs).unwrap();

        let store = MockStore::new(); // empty
        let mut wafer = wafer_with_reference("deadbeef");

        let merge = MergeTool::new(&tool).with_scratch_dir(&dirs);
        assert!(
            merge
                .merge_wafer("M31265", "pactech", &mut wafer, &store)
                .is_err()
        );
        assert_eq!(fs::read_dir(&dirs).unwrap().count(), 0);
    }

    #[test]
    fn test_inline_payloads_skip_the_store() {
        let scratch = tempfile::tempdir().unwrap();
        let out_probe = scratch.path().join("seen-input");
        let script = format!(
            "#!/bin/sh\nfor arg in \"$@\"; do case \"$arg\" in localFolder=*) in=\"${{arg#localFolder=}}\" ;; esac; done\ncat \"$in\"/* > {}\nexit 0\n",
            out_probe.display()
        );
        let tool = stub_tool(scratch.path(), &script);

        let store = MockStore::new(); // empty store: any get would fail
        let mut wafer = Wafer::new("7", "42");
        let mut wafermap = Wafermap::new("inline-map");
        wafermap.set_format(MERGE_FORMAT, Format::Inline(b"WMAP inline".to_vec()));
        wafer.wafermaps.push(wafermap);

        let merge = MergeTool::new(&tool);
        merge
            .merge_wafer("M31265", "pactech", &mut wafer, &store)
            .expect("merge failed");
        assert_eq!(fs::read(&out_probe).unwrap(), b"WMAP inline");
    }
}
