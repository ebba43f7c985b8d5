mod common;

use std::sync::Arc;

use xref_fetch::cancel::CancellationToken;
use xref_fetch::client::RateLimitAwareClient;
use xref_fetch::domain::FetchAction;
use xref_fetch::error::FailureKind;
use xref_fetch::executor::RetryableHttpExecutor;
use xref_fetch::rate_limit::RateLimitState;
use xref_fetch::retriever::{DataRetriever, Retriever};
use xref_fetch::scheduler::BoundedConcurrencyScheduler;
use xref_fetch::services::ServiceProfile;
use xref_fetch::strategy::{FtpGet, HttpGet};
use xref_fetch::transport::{HttpResponse, TransportError};

use common::{RecordingSleeper, ScriptedTransport, task, utf8_dir};

fn retriever(
    name: &str,
    transport: &Arc<ScriptedTransport>,
    strategy: Box<dyn xref_fetch::strategy::FetchStrategy>,
) -> Retriever {
    let executor = RetryableHttpExecutor::new(transport.clone(), CancellationToken::new());
    let client = RateLimitAwareClient::new(executor, Arc::new(RecordingSleeper::default()));
    let profile = ServiceProfile::resolve(name, None).unwrap();
    let state = Arc::new(RateLimitState::for_profile(&profile));
    Retriever::new(name, strategy, client, profile, state)
}

fn plain_get() -> Box<HttpGet> {
    Box::new(HttpGet {
        ids_per_request: None,
        separator: ",".to_string(),
    })
}

#[test]
fn second_run_within_max_age_skips_network() {
    let dir = tempfile::tempdir().unwrap();
    let destination = utf8_dir(&dir).join("zinc/zinc_uniprot.txt");
    let transport = Arc::new(ScriptedTransport::new(Vec::new()).with_fallback("ZINC1\tP1\n"));
    let zinc = retriever("zinc", &transport, plain_get());
    let task = task("zinc", "https://zinc.docking.org/uniprot.txt", destination.clone());

    let first = zinc.retrieve(&task).unwrap();
    let second = zinc.retrieve(&task).unwrap();

    assert_eq!(first.action, FetchAction::Downloaded);
    assert_eq!(first.bytes, 9);
    assert_eq!(second.action, FetchAction::Fresh);
    assert_eq!(second.attempts, 0);
    assert_eq!(transport.calls(), 1);
    assert_eq!(
        std::fs::read_to_string(destination.as_std_path()).unwrap(),
        "ZINC1\tP1\n"
    );
}

#[test]
fn failed_download_leaves_no_file() {
    let dir = tempfile::tempdir().unwrap();
    let destination = utf8_dir(&dir).join("kegg/hsa.txt");
    let transport = Arc::new(ScriptedTransport::new(vec![Ok(HttpResponse::new(
        400,
        "bad request",
    ))]));
    let kegg = retriever("kegg", &transport, plain_get());

    let result = kegg
        .retrieve(&task("kegg", "https://rest.kegg.jp/conv/hsa/uniprot", destination.clone()))
        .unwrap();

    assert_eq!(result.action, FetchAction::Failed);
    assert_eq!(result.error_kind, Some(FailureKind::TerminalStatus));
    assert_eq!(result.attempts, 1);
    assert!(!destination.exists());
}

#[test]
fn one_failing_page_discards_earlier_pages() {
    let dir = tempfile::tempdir().unwrap();
    let destination = utf8_dir(&dir).join("uniprot_9606.tsv");
    let transport = Arc::new(ScriptedTransport::new(vec![
        Ok(HttpResponse::new(200, "P1\n")),
        Err(TransportError::Io("connection reset".to_string())),
    ]));
    let strategy = Box::new(HttpGet {
        ids_per_request: Some(1),
        separator: ",".to_string(),
    });
    let uniprot = retriever("uniprot", &transport, strategy);
    let mut task = task(
        "uniprot",
        "https://rest.uniprot.org/uniprotkb/accessions?accessions={ids}",
        destination.clone(),
    );
    task.identifiers = vec!["P1".to_string(), "P2".to_string()];

    let result = uniprot.retrieve(&task).unwrap();

    assert_eq!(result.error_kind, Some(FailureKind::Io));
    assert_eq!(result.attempts, 2);
    assert_eq!(transport.calls(), 2);
    assert!(!destination.exists());
}

#[test]
fn paged_identifiers_are_concatenated() {
    let dir = tempfile::tempdir().unwrap();
    let destination = utf8_dir(&dir).join("uniprot_9606.tsv");
    let transport = Arc::new(ScriptedTransport::new(vec![
        Ok(HttpResponse::new(200, "P1\nP2\n")),
        Ok(HttpResponse::new(200, "P3\n")),
    ]));
    let strategy = Box::new(HttpGet {
        ids_per_request: Some(2),
        separator: ",".to_string(),
    });
    let uniprot = retriever("uniprot", &transport, strategy);
    let mut task = task(
        "uniprot",
        "https://rest.uniprot.org/uniprotkb/accessions?accessions={ids}",
        destination.clone(),
    );
    task.identifiers = vec!["P1".to_string(), "P2".to_string(), "P3".to_string()];

    let result = uniprot.retrieve(&task).unwrap();

    assert_eq!(result.attempts, 2);
    assert_eq!(transport.urls().len(), 2);
    assert!(transport.urls()[1].ends_with("accessions=P3"));
    assert_eq!(
        std::fs::read_to_string(destination.as_std_path()).unwrap(),
        "P1\nP2\nP3\n"
    );
}

#[test]
fn connect_retry_budget_comes_from_task() {
    let dir = tempfile::tempdir().unwrap();
    let destination = utf8_dir(&dir).join("chembl.txt");
    let transport = Arc::new(ScriptedTransport::new(
        (0..10)
            .map(|_| Err(TransportError::ConnectTimeout("timed out".to_string())))
            .collect(),
    ));
    let ftp = retriever("chembl", &transport, Box::new(FtpGet));
    let mut task = task(
        "chembl",
        "ftp://ftp.ebi.ac.uk/pub/databases/chembl/uniprot_mapping.txt",
        destination.clone(),
    );
    task.retry_budget = 1;

    let result = ftp.retrieve(&task).unwrap();

    assert_eq!(result.error_kind, Some(FailureKind::ConnectionFailure));
    assert_eq!(result.attempts, 2);
    assert_eq!(transport.calls(), 2);
    assert!(!destination.exists());
}

#[test]
fn scheduled_failure_reports_requests_sent() {
    let dir = tempfile::tempdir().unwrap();
    let root = utf8_dir(&dir);
    let transport = Arc::new(ScriptedTransport::new(
        (0..4)
            .map(|_| Err(TransportError::ConnectTimeout("timed out".to_string())))
            .collect(),
    ));
    let uniprot = Arc::new(retriever("uniprot", &transport, plain_get()));
    let tasks = vec![task("uniprot", "https://rest.uniprot.org/x.tsv", root.join("x.tsv"))];
    let scheduler = BoundedConcurrencyScheduler::new(CancellationToken::new())
        .with_sleeper(Arc::new(RecordingSleeper::default()));

    let results = scheduler.run_all(uniprot, tasks, 1).unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].action, FetchAction::Failed);
    assert_eq!(results[0].attempts, 4);
    assert_eq!(transport.calls(), 4);
    assert!(results[0].message.as_deref().unwrap().contains("4 attempts"));
}
