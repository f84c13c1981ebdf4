// End-to-end flow through the public API: a lot document goes in, each
// wafer is merged by a (stubbed) external tool, produced maps are uploaded,
// and the enriched document comes out on the success destination.
use mapmerge::codec;
use mapmerge::lot::{Format, Lot, MERGE_FORMAT, Wafer, Wafermap};
use mapmerge::merge::MergeTool;
use mapmerge::pipeline::{MockPublisher, Pipeline};
use mapmerge::store::{ContentStoreLike, MockStore};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

fn stub_tool(dir: &Path, script: &str) -> PathBuf {
    let path = dir.join("stub-merge.sh");
    fs::write(&path, script).expect("failed to write stub tool");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
        .expect("failed to chmod stub tool");
    path
}

// Checks that the input payload actually arrived on disk, then produces two
// result maps.
const MERGE_STUB: &str = r#"#!/bin/sh
for arg in "$@"; do
  case "$arg" in
    localFolder=*) in="${arg#localFolder=}" ;;
    DestinationDir=*) out="${arg#DestinationDir=}" ;;
  esac
done
grep -q 'WMAP' "$in"/* || { echo 'no wafermap supplied' >&2; exit 3; }
printf 'MERGED-A' > "$out/result-a"
printf 'MERGED-B' > "$out/result-b"
exit 0
"#;

const FAILING_STUB: &str = r#"#!/bin/sh
printf 'bad input' >&2
exit 2
"#;

fn one_wafer_lot() -> Vec<u8> {
    let mut lot = Lot::new("M31265", "201210600", "1", "IEPER", "IEPER", "MLX_BOGUS");
    lot.config
        .insert("processStep".to_string(), "pactech".to_string());
    let mut wafer = Wafer::new("1", "100");
    wafer
        .config
        .insert("site".to_string(), "erfurt".to_string());
    let mut wafermap = Wafermap::new("blaat");
    wafermap.set_format("TH01", Format::Referenced("deadbeef".to_string()));
    wafer.wafermaps.push(wafermap);
    lot.wafers.push(wafer);
    codec::encode(&lot).expect("encode failed")
}

#[test]
fn test_lot_flows_to_success_destination_with_uploaded_maps() {
    let scratch = tempfile::tempdir().unwrap();
    let tool = stub_tool(scratch.path(), MERGE_STUB);

    let store = MockStore::new();
    store.insert("deadbeef", b"WMAP....");
    let pipeline = Pipeline::new(
        store,
        MergeTool::new(&tool),
        "postprocessing.mapmerge.out",
        "exceptions.postprocessing",
    );
    let mut publisher = MockPublisher::new();

    pipeline.handle_message(&one_wafer_lot(), &mut publisher);

    assert_eq!(publisher.sent.len(), 1);
    let (destination, body) = &publisher.sent[0];
    assert_eq!(destination, "postprocessing.mapmerge.out");

    let lot = codec::decode(body).expect("published lot must decode");
    assert_eq!(lot.name, "M31265");
    assert_eq!(lot.wafers.len(), 1);
    let wafermaps = &lot.wafers[0].wafermaps;
    assert_eq!(wafermaps.len(), 3, "one original and two merged maps");

    // The original reference rides through untouched.
    assert_eq!(
        wafermaps[0].format(MERGE_FORMAT),
        Some(&Format::Referenced("deadbeef".to_string()))
    );

    // Both produced maps were uploaded and now carry distinct references.
    let r1 = wafermaps[1]
        .format(MERGE_FORMAT)
        .and_then(Format::reference)
        .expect("first merged map must be referenced");
    let r2 = wafermaps[2]
        .format(MERGE_FORMAT)
        .and_then(Format::reference)
        .expect("second merged map must be referenced");
    assert_ne!(r1, r2);
}

#[test]
fn test_uploaded_payloads_match_the_tool_output() {
    let scratch = tempfile::tempdir().unwrap();
    let tool = stub_tool(scratch.path(), MERGE_STUB);

    let store = MockStore::new();
    store.insert("deadbeef", b"WMAP....");
    let pipeline = Pipeline::new(
        store,
        MergeTool::new(&tool),
        "postprocessing.mapmerge.out",
        "exceptions.postprocessing",
    );
    let mut publisher = MockPublisher::new();
    pipeline.handle_message(&one_wafer_lot(), &mut publisher);

    let (_, body) = &publisher.sent[0];
    let lot = codec::decode(body).unwrap();
    let store = pipeline_store(&pipeline);
    let mut payloads: Vec<Vec<u8>> = lot.wafers[0].wafermaps[1..]
        .iter()
        .map(|wafermap| {
            let reference = wafermap
                .format(MERGE_FORMAT)
                .and_then(Format::reference)
                .unwrap();
            store.get(reference).expect("uploaded payload must resolve")
        })
        .collect();
    payloads.sort();
    assert_eq!(payloads, vec![b"MERGED-A".to_vec(), b"MERGED-B".to_vec()]);
}

// The pipeline owns its store; integration tests reach it through the same
// trait object the pipeline uses.
fn pipeline_store(pipeline: &Pipeline<MockStore>) -> &MockStore {
    pipeline.store()
}

#[test]
fn test_merge_failure_routes_diagnostic_with_tool_output() {
    let scratch = tempfile::tempdir().unwrap();
    let tool = stub_tool(scratch.path(), FAILING_STUB);

    let store = MockStore::new();
    store.insert("deadbeef", b"WMAP....");
    let pipeline = Pipeline::new(
        store,
        MergeTool::new(&tool),
        "postprocessing.mapmerge.out",
        "exceptions.postprocessing",
    );
    let mut publisher = MockPublisher::new();

    let message = one_wafer_lot();
    pipeline.handle_message(&message, &mut publisher);

    assert_eq!(publisher.sent.len(), 1);
    let (destination, body) = &publisher.sent[0];
    assert_eq!(destination, "exceptions.postprocessing");

    let report: serde_json::Value = serde_json::from_slice(body).expect("diagnostic must be json");
    assert_eq!(report["kind"], "merge-failed");
    assert_eq!(report["stderr"], "bad input");
    assert!(report["message"].as_str().unwrap().contains("code 2"));

    // The diagnostic carries the whole original message.
    use base64::Engine as _;
    let original = base64::engine::general_purpose::STANDARD
        .decode(report["original_message"].as_str().unwrap())
        .unwrap();
    assert_eq!(original, message);
}
