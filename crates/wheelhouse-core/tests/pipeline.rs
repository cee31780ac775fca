//! Resolve -> select -> download against a mock index

use futures::StreamExt;
use serde_json::json;
use tempfile::TempDir;
use wheelhouse_core::{StagingArea, WheelhouseCore};
use wheelhouse_types::{CoreEvent, JobStatus, ResolveEvent, Settings};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn document(server: &MockServer, name: &str, deps: &[&str], wheels: &[&str]) -> serde_json::Value {
    let files: Vec<_> = wheels
        .iter()
        .map(|filename| {
            json!({
                "filename": filename,
                "url": format!("{}/files/{}", server.uri(), filename),
                "packagetype": "bdist_wheel"
            })
        })
        .collect();

    json!({
        "info": {
            "name": name,
            "version": "1.0.0",
            "summary": format!("{} package", name),
            "author": "someone",
            "license": "MIT",
            "requires_dist": deps
        },
        "releases": { "1.0.0": files },
        "urls": []
    })
}

async fn publish(server: &MockServer, name: &str, deps: &[&str], wheels: &[&str]) {
    Mock::given(method("GET"))
        .and(path(format!("/pypi/{}/json", name)))
        .respond_with(ResponseTemplate::new(200).set_body_json(document(server, name, deps, wheels)))
        .mount(server)
        .await;

    for filename in wheels {
        Mock::given(method("GET"))
            .and(path(format!("/files/{}", filename)))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(filename.as_bytes().to_vec()))
            .mount(server)
            .await;
    }
}

#[tokio::test]
async fn resolve_select_and_download() {
    let server = MockServer::start().await;
    publish(
        &server,
        "app",
        &[
            "helper>=1.0; python_version >= '3.8'",
            "winonly; sys_platform == 'win32'",
            "testing-extra; extra == 'test'",
        ],
        &[
            "app-1.0.0-py3-none-any.whl",
            "app-1.0.0-cp311-cp311-manylinux2014_x86_64.whl",
            "app-1.0.0-cp311-cp311-win_amd64.whl",
        ],
    )
    .await;
    publish(&server, "helper", &["native"], &["helper-1.0.0-py3-none-any.whl"]).await;
    publish(
        &server,
        "native",
        &[],
        &["native-1.0.0-cp311-cp311-macosx_11_0_arm64.whl"],
    )
    .await;

    let output = TempDir::new().unwrap();
    let settings = Settings {
        index_url: format!("{}/simple/", server.uri()),
        output_dir: output.path().join("wheels"),
        platform: "manylinux2014_x86_64".into(),
        python_version: "3.11".into(),
        ..Settings::default()
    };
    let core = WheelhouseCore::new(settings).unwrap();

    let mut staging = StagingArea::new();
    let events: Vec<ResolveEvent> = core.resolve(vec!["App".to_string()]).collect().await;
    for event in &events {
        staging.apply(event);
    }

    assert_eq!(staging.len(), 3);
    assert_eq!(staging.summary(), "1 package + 2 deps");
    assert!(!staging.contains("winonly"));
    assert!(matches!(
        events.last(),
        Some(ResolveEvent::Complete { staged: 3, missing: 0 })
    ));

    let mut rx = core.subscribe();
    let ids = core.download_all(&staging).await.unwrap();
    assert_eq!(ids.len(), 2);
    core.downloads().wait_until_settled().await;

    let states = core.downloads().snapshot_all();
    assert!(states.iter().all(|s| s.status == JobStatus::Completed));
    assert_eq!(
        states[0].filename,
        "app-1.0.0-cp311-cp311-manylinux2014_x86_64.whl"
    );

    let mut incompatible = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let CoreEvent::NoCompatibleArtifact { name, .. } = event {
            incompatible.push(name);
        }
    }
    assert_eq!(incompatible, vec!["native"]);

    let summary = core.transfer_summary(&staging).await.unwrap();
    assert_eq!(summary.files.len(), 2);
    assert!(summary.install_command.ends_with(" app"));

    // A second run finds everything on disk and transfers nothing
    let again = core.download_all(&staging).await.unwrap();
    assert_eq!(again.len(), 2);
    let progress = core.downloads().aggregate();
    assert_eq!(progress.completed, 2);
    assert!(progress.is_settled());
}
