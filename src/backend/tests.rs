//! Unit tests for the session lifecycle and the individual runners.

use std::sync::Arc;

use camino::Utf8PathBuf;
use rstest::rstest;
use tempfile::TempDir;

use super::remote::shell_invocation;
use super::*;
use crate::connection::{ConnectionError, ConnectionManager, HostSpec};
use crate::exec::CommandOutput;
use crate::sink::MemorySink;
use crate::test_support::{
    CountingResolver, FakeConnector, MemoryNotifier, ScriptedRunner, StaticAccountProvider,
};

struct Fixture {
    manager: SessionManager,
    sink: MemorySink,
    notifier: MemoryNotifier,
}

fn manager_with(backend: Arc<dyn RunnerBackend>) -> Fixture {
    let sink = MemorySink::new();
    let notifier = MemoryNotifier::new();
    let manager = SessionManager::new(Arc::new(sink.clone()), Arc::new(notifier.clone()))
        .with_backend(backend);
    Fixture {
        manager,
        sink,
        notifier,
    }
}

/// Workspace containing a stand-in interpreter executable and `site.yml`.
struct Workspace {
    _dir: TempDir,
    root: Utf8PathBuf,
    interpreter: Utf8PathBuf,
}

fn workspace() -> Workspace {
    let dir = TempDir::new().expect("tempdir");
    let root = Utf8PathBuf::from_path_buf(dir.path().join("work")).expect("utf8");
    std::fs::create_dir_all(&root).expect("create workspace");
    std::fs::write(root.join("site.yml"), "- hosts: all\n").expect("write playbook");
    let interpreter = Utf8PathBuf::from_path_buf(dir.path().join("ansible-playbook")).expect("utf8");
    std::fs::write(&interpreter, "#!/bin/sh\n").expect("write interpreter");
    Workspace {
        _dir: dir,
        root,
        interpreter,
    }
}

async fn wait_until_running(manager: &SessionManager, id: SessionId) {
    let mut receiver = manager.subscribe(id).expect("session exists");
    receiver
        .wait_for(|state| *state == SessionState::Running)
        .await
        .expect("session reaches running");
}

#[rstest]
#[case(SessionState::Idle, SessionState::Starting, true)]
#[case(SessionState::Starting, SessionState::Provisioning, true)]
#[case(SessionState::Starting, SessionState::Running, true)]
#[case(SessionState::Provisioning, SessionState::Running, true)]
#[case(SessionState::Running, SessionState::Completed { exit_code: Some(0) }, true)]
#[case(SessionState::Provisioning, SessionState::Failed { reason: String::new() }, true)]
#[case(SessionState::Idle, SessionState::Interrupted, true)]
#[case(SessionState::Idle, SessionState::Running, false)]
#[case(SessionState::Running, SessionState::Provisioning, false)]
#[case(SessionState::Starting, SessionState::Completed { exit_code: Some(0) }, false)]
#[case(SessionState::Interrupted, SessionState::Failed { reason: String::new() }, false)]
#[case(SessionState::Completed { exit_code: Some(1) }, SessionState::Interrupted, false)]
fn transitions_follow_the_lifecycle(
    #[case] from: SessionState,
    #[case] to: SessionState,
    #[case] allowed: bool,
) {
    assert_eq!(from.permits(&to), allowed, "{from:?} -> {to:?}");
}

#[test]
fn terminal_states_absorb_later_updates() {
    let progress = SessionProgress::new(BackendKind::Local, Arc::new(MemorySink::new()));
    assert!(progress.advance(SessionState::Starting));
    assert!(progress.advance(SessionState::Interrupted));
    assert!(!progress.advance(SessionState::Running));
    assert_eq!(progress.state(), SessionState::Interrupted);
}

#[rstest]
#[case("local", BackendKind::Local)]
#[case("Docker", BackendKind::Container)]
#[case("remote-shell", BackendKind::RemoteShell)]
#[case("cloudshell", BackendKind::CloudShell)]
fn backend_kinds_parse_with_aliases(#[case] raw: &str, #[case] kind: BackendKind) {
    assert_eq!(raw.parse::<BackendKind>(), Ok(kind));
}

#[test]
fn unknown_backend_names_are_rejected() {
    let err = "mainframe".parse::<BackendKind>().expect_err("unknown");
    assert!(err.contains("mainframe"), "{err}");
}

#[test]
fn playbook_paths_resolve_against_the_workspace() {
    let request = ExecutionRequest::new(BackendKind::Local, "/work");
    assert_eq!(request.playbook_path("site.yml"), Utf8PathBuf::from("/work/site.yml"));

    let nested = request
        .clone()
        .with_playbook(Some(Utf8PathBuf::from("/work/plays/db.yml")));
    assert_eq!(
        nested.playbook_in_workspace("site.yml"),
        Ok(Utf8PathBuf::from("plays/db.yml"))
    );

    let outside = request.with_playbook(Some(Utf8PathBuf::from("/etc/evil.yml")));
    assert!(matches!(
        outside.playbook_in_workspace("site.yml"),
        Err(RunError::InvalidRequest { .. })
    ));
}

#[test]
fn auth_connection_errors_map_to_auth_run_errors() {
    let err = RunError::from(ConnectionError::Auth {
        host: String::from("h"),
        message: String::from("no key"),
    });
    assert!(matches!(err, RunError::Auth { .. }), "{err}");
}

#[tokio::test]
async fn missing_backend_is_rejected_up_front() {
    let sink = MemorySink::new();
    let manager = SessionManager::new(Arc::new(sink), Arc::new(MemoryNotifier::new()));
    let err = manager
        .run_playbook(ExecutionRequest::new(BackendKind::Container, "/work"))
        .expect_err("no runner registered");
    assert_eq!(
        err,
        RunError::NoBackend {
            kind: BackendKind::Container
        }
    );
}

#[tokio::test]
async fn local_runner_passes_absolute_playbook_and_env() {
    let ws = workspace();
    let runner = ScriptedRunner::new();
    runner.push_output(2, "PLAY RECAP\nok=1 failed=1");
    let fixture = manager_with(Arc::new(LocalRunner::new(
        ws.interpreter.as_str(),
        "site.yml",
        Arc::new(runner.clone()),
    )));

    let request = ExecutionRequest::new(BackendKind::Local, ws.root.clone()).with_env("A", "1");
    let id = fixture.manager.run_playbook(request).expect("dispatched");
    let state = fixture.manager.wait(id).await;

    assert_eq!(state, Some(SessionState::Completed { exit_code: Some(2) }));
    let invocations = runner.invocations();
    let [invocation] = invocations.as_slice() else {
        panic!("expected one invocation, got {invocations:?}");
    };
    assert_eq!(invocation.program, ws.interpreter.as_str());
    assert_eq!(
        invocation.command_string(),
        format!("{} {}/site.yml", ws.interpreter, ws.root)
    );
    assert_eq!(invocation.working_dir.as_deref(), Some(ws.root.as_path()));
    assert_eq!(invocation.env.get("A").map(String::as_str), Some("1"));
    assert!(fixture.sink.contains("PLAY RECAP"));
    assert!(fixture.sink.contains("[local] playbook finished with exit code 2"));
    assert!(fixture.notifier.messages().is_empty());
}

#[tokio::test]
async fn local_runner_reports_missing_interpreter() {
    let runner = ScriptedRunner::new();
    let fixture = manager_with(Arc::new(LocalRunner::new(
        "/nonexistent/playrun/ansible-playbook",
        "site.yml",
        Arc::new(runner.clone()),
    )));

    let id = fixture
        .manager
        .run_playbook(ExecutionRequest::new(BackendKind::Local, "/work"))
        .expect("dispatched");
    let state = fixture.manager.wait(id).await;

    let Some(SessionState::Failed { reason }) = state else {
        panic!("expected failure, got {state:?}");
    };
    assert!(reason.contains("executable not found"), "{reason}");
    assert!(runner.invocations().is_empty());
    assert_eq!(fixture.notifier.messages().len(), 1);
    assert!(fixture.sink.contains("[local] playbook run failed"));
}

#[tokio::test]
async fn interrupt_cancels_a_running_session_once() {
    let ws = workspace();
    let runner = ScriptedRunner::new();
    runner.push_pending();
    let fixture = manager_with(Arc::new(LocalRunner::new(
        ws.interpreter.as_str(),
        "site.yml",
        Arc::new(runner),
    )));

    let id = fixture
        .manager
        .run_playbook(ExecutionRequest::new(BackendKind::Local, ws.root.clone()))
        .expect("dispatched");
    wait_until_running(&fixture.manager, id).await;
    assert_eq!(fixture.manager.active_count(), 1);

    assert!(fixture.manager.interrupt(id).await);
    assert_eq!(fixture.manager.state(id), Some(SessionState::Interrupted));
    assert_eq!(fixture.manager.active_count(), 0);
    assert!(fixture.sink.contains(&format!("session {id} interrupted")));

    assert!(!fixture.manager.interrupt(id).await);
    assert!(!fixture.manager.interrupt(SessionId::new()).await);
}

#[tokio::test]
async fn finished_sessions_are_dropped_on_the_next_dispatch() {
    let ws = workspace();
    let runner = ScriptedRunner::new();
    runner.push_output(0, "");
    runner.push_pending();
    runner.push_output(0, "");
    let fixture = manager_with(Arc::new(LocalRunner::new(
        ws.interpreter.as_str(),
        "site.yml",
        Arc::new(runner),
    )));
    let request = || ExecutionRequest::new(BackendKind::Local, ws.root.clone());

    let finished = fixture.manager.run_playbook(request()).expect("dispatched");
    fixture.manager.wait(finished).await;
    assert_eq!(
        fixture.manager.state(finished),
        Some(SessionState::Completed { exit_code: Some(0) })
    );

    let running = fixture.manager.run_playbook(request()).expect("dispatched");
    assert_eq!(fixture.manager.state(finished), None);
    wait_until_running(&fixture.manager, running).await;

    let last = fixture.manager.run_playbook(request()).expect("dispatched");
    assert_eq!(fixture.manager.state(running), Some(SessionState::Running));
    fixture.manager.wait(last).await;
    assert!(fixture.manager.interrupt(running).await);
}

#[tokio::test]
async fn container_runner_stops_when_the_runtime_is_unreachable() {
    let runner = ScriptedRunner::new();
    runner.push_output(1, "");
    let fixture = manager_with(Arc::new(ContainerRunner::new(
        "docker",
        "ansible:latest",
        Arc::new(runner.clone()),
    )));

    let id = fixture
        .manager
        .run_playbook(ExecutionRequest::new(BackendKind::Container, "/work"))
        .expect("dispatched");
    let state = fixture.manager.wait(id).await;

    let Some(SessionState::Failed { reason }) = state else {
        panic!("expected failure, got {state:?}");
    };
    assert!(reason.contains("docker is unavailable"), "{reason}");
    assert_eq!(runner.invocations().len(), 1);
}

#[tokio::test]
async fn container_runner_reports_missing_runtime_as_unavailable() {
    let runner = ScriptedRunner::new();
    runner.push_missing("podman");
    let fixture = manager_with(Arc::new(ContainerRunner::new(
        "podman",
        "ansible:latest",
        Arc::new(runner),
    )));

    let id = fixture
        .manager
        .run_playbook(ExecutionRequest::new(BackendKind::Container, "/work"))
        .expect("dispatched");
    let state = fixture.manager.wait(id).await;

    let Some(SessionState::Failed { reason }) = state else {
        panic!("expected failure, got {state:?}");
    };
    assert!(reason.contains("podman is unavailable"), "{reason}");
}

#[tokio::test]
async fn container_runner_mounts_the_workspace() {
    let runner = ScriptedRunner::new();
    runner.push_output(0, "24.0.7");
    runner.push_output(0, "PLAY RECAP");
    let fixture = manager_with(Arc::new(
        ContainerRunner::new("docker", "ansible:latest", Arc::new(runner.clone()))
            .with_mount_path("/src"),
    ));

    let request = ExecutionRequest::new(BackendKind::Container, "/work")
        .with_playbook(Some(Utf8PathBuf::from("plays/web.yml")))
        .with_env("ANSIBLE_FORCE_COLOR", "1");
    let id = fixture.manager.run_playbook(request).expect("dispatched");
    let state = fixture.manager.wait(id).await;

    assert_eq!(state, Some(SessionState::Completed { exit_code: Some(0) }));
    let commands: Vec<String> = runner
        .invocations()
        .iter()
        .map(crate::test_support::CommandInvocation::command_string)
        .collect();
    assert_eq!(
        commands,
        vec![
            String::from("docker version --format {{.Server.Version}}"),
            String::from(
                "docker run --rm -v /work:/src -w /src -e ANSIBLE_FORCE_COLOR=1 \
                 ansible:latest ansible-playbook plays/web.yml"
            ),
        ]
    );
}

#[test]
fn shell_invocation_escapes_every_word() {
    let mut env = std::collections::BTreeMap::new();
    env.insert(String::from("A"), String::from("1"));
    env.insert(String::from("B"), String::from("two words"));
    assert_eq!(
        shell_invocation("/srv/my work", &env, "ansible-playbook", "site.yml"),
        "cd '/srv/my work' && env A=1 'B=two words' ansible-playbook site.yml"
    );
    assert_eq!(
        shell_invocation("/srv/w", &std::collections::BTreeMap::new(), "ap", "p.yml"),
        "cd /srv/w && ap p.yml"
    );
}

fn remote_host() -> HostSpec {
    HostSpec::new("deploy", "build.example.com", 22)
}

#[tokio::test]
async fn remote_runner_prepares_directory_and_releases_its_lease() {
    let connector = FakeConnector::new();
    connector.set_exec_result(&["PLAY [all]", "PLAY RECAP"], 0);
    let connections = ConnectionManager::new(connector.clone(), CountingResolver::new());
    let fixture = manager_with(Arc::new(RemoteShellRunner::new(
        remote_host(),
        "/srv/playrun",
        connections.clone(),
    )));

    let id = fixture
        .manager
        .run_playbook(ExecutionRequest::new(BackendKind::RemoteShell, "/home/me/work"))
        .expect("dispatched");
    let state = fixture.manager.wait(id).await;

    assert_eq!(state, Some(SessionState::Completed { exit_code: Some(0) }));
    let connection = connector.last().expect("connected");
    assert_eq!(
        connection.commands(),
        vec![
            String::from("mkdir -p /srv/playrun/work"),
            String::from("cd /srv/playrun/work && ansible-playbook site.yml"),
        ]
    );
    assert!(fixture.sink.contains("> cd /srv/playrun/work && ansible-playbook site.yml"));
    assert!(fixture.sink.position("PLAY [all]") < fixture.sink.position("PLAY RECAP"));
    assert!(!connections.is_pooled(&remote_host()));
    assert_eq!(connection.closes(), 1);
}

#[tokio::test]
async fn remote_runner_fails_before_running_when_mkdir_is_rejected() {
    let connector = FakeConnector::new();
    connector.respond_to(
        "mkdir",
        CommandOutput {
            code: Some(1),
            stdout: String::new(),
            stderr: String::from("Permission denied\n"),
        },
    );
    let connections = ConnectionManager::new(connector.clone(), CountingResolver::new());
    let fixture = manager_with(Arc::new(RemoteShellRunner::new(
        remote_host(),
        "/srv/playrun",
        connections.clone(),
    )));

    let id = fixture
        .manager
        .run_playbook(ExecutionRequest::new(BackendKind::RemoteShell, "/home/me/work"))
        .expect("dispatched");
    let state = fixture.manager.wait(id).await;

    let Some(SessionState::Failed { reason }) = state else {
        panic!("expected failure, got {state:?}");
    };
    assert!(
        reason.contains("could not create /srv/playrun/work: Permission denied"),
        "{reason}"
    );
    let connection = connector.last().expect("connected");
    assert_eq!(connection.commands(), vec![String::from("mkdir -p /srv/playrun/work")]);
    assert!(!connections.is_pooled(&remote_host()));
    assert_eq!(fixture.notifier.messages().len(), 1);
}

#[tokio::test]
async fn remote_runner_surfaces_connection_failures() {
    let connector = FakeConnector::new();
    connector.refuse_connections(true);
    let connections = ConnectionManager::new(connector, CountingResolver::new());
    let fixture = manager_with(Arc::new(RemoteShellRunner::new(
        remote_host(),
        "/srv/playrun",
        connections,
    )));

    let id = fixture
        .manager
        .run_playbook(ExecutionRequest::new(BackendKind::RemoteShell, "/home/me/work"))
        .expect("dispatched");
    let state = fixture.manager.wait(id).await;

    let Some(SessionState::Failed { reason }) = state else {
        panic!("expected failure, got {state:?}");
    };
    assert!(reason.contains("connection refused"), "{reason}");
}

#[test]
fn accounts_parse_with_optional_tenant() {
    assert_eq!(
        Account::parse(" alice@contoso "),
        Some(Account {
            name: String::from("alice"),
            tenant: Some(String::from("contoso")),
        })
    );
    assert_eq!(
        Account::parse("bob@"),
        Some(Account {
            name: String::from("bob"),
            tenant: None,
        })
    );
    assert_eq!(Account::parse("  "), None);
    assert_eq!(Account::parse("@contoso"), None);
}

fn alice() -> Account {
    Account {
        name: String::from("alice"),
        tenant: Some(String::from("contoso")),
    }
}

#[tokio::test]
async fn cloud_shell_requires_a_signed_in_account() {
    let connector = FakeConnector::new();
    let connections = ConnectionManager::new(connector.clone(), CountingResolver::new());
    let fixture = manager_with(Arc::new(CloudShellRunner::new(
        Arc::new(StaticAccountProvider::new(None)),
        connections,
    )));

    let id = fixture
        .manager
        .run_playbook(ExecutionRequest::new(BackendKind::CloudShell, "/work"))
        .expect("dispatched");
    let state = fixture.manager.wait(id).await;

    let Some(SessionState::Failed { reason }) = state else {
        panic!("expected failure, got {state:?}");
    };
    assert!(reason.contains("no cloud account is signed in"), "{reason}");
    assert_eq!(connector.connects(), 0);
}

#[tokio::test]
async fn cloud_shell_uploads_the_playbook_and_runs_it() {
    let ws = workspace();
    let connector = FakeConnector::new();
    connector.set_exec_result(&["PLAY RECAP"], 0);
    let connections = ConnectionManager::new(connector.clone(), CountingResolver::new());
    let fixture = manager_with(Arc::new(CloudShellRunner::new(
        Arc::new(StaticAccountProvider::new(Some(alice()))),
        connections.clone(),
    )));

    let id = fixture
        .manager
        .run_playbook(ExecutionRequest::new(BackendKind::CloudShell, ws.root.clone()))
        .expect("dispatched");
    let state = fixture.manager.wait(id).await;

    assert_eq!(state, Some(SessionState::Completed { exit_code: Some(0) }));
    let connection = connector.last().expect("connected");
    assert_eq!(
        connection.uploads(),
        vec![(ws.root.join("site.yml"), String::from("playrun/site.yml"))]
    );
    assert_eq!(
        connection.commands(),
        vec![
            String::from("mkdir -p playrun"),
            String::from("cd playrun && ansible-playbook site.yml"),
        ]
    );
    assert!(fixture.sink.contains("[cloud-shell] provisioning cloud shell for alice"));
    assert!(!connections.is_pooled(&cloud_shell_host(&alice())));
}

#[tokio::test]
async fn cloud_shell_connector_drives_the_launcher() {
    let runner = ScriptedRunner::new();
    runner.push_output(0, "sess-1\n");
    runner.push_output(0, "hi\n");
    let connections = ConnectionManager::new(
        CloudShellConnector::new("cloudshell", Arc::new(runner.clone())),
        CountingResolver::new(),
    );

    let lease = connections
        .acquire(&cloud_shell_host(&alice()))
        .await
        .expect("connected");
    let output = lease.connection().capture("echo hi").await.expect("captured");
    assert_eq!(output.stdout, "hi\n");
    lease.release();

    let mut commands = Vec::new();
    for _ in 0..20 {
        commands = runner
            .invocations()
            .iter()
            .map(crate::test_support::CommandInvocation::command_string)
            .collect();
        if commands.len() >= 3 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(
        commands,
        vec![
            String::from("cloudshell connect --account alice --tenant contoso"),
            String::from("cloudshell exec --session sess-1 -- sh -c echo hi"),
            String::from("cloudshell disconnect --session sess-1"),
        ]
    );
}

#[tokio::test]
async fn cloud_shell_connector_rejects_empty_session_ids() {
    let runner = ScriptedRunner::new();
    runner.push_output(0, "  \n");
    let connections = ConnectionManager::new(
        CloudShellConnector::new("cloudshell", Arc::new(runner)),
        CountingResolver::new(),
    );

    let err = connections
        .acquire(&cloud_shell_host(&alice()))
        .await
        .expect_err("no session id");
    assert!(err.to_string().contains("no session id"), "{err}");
}

#[test]
fn cloud_shell_hosts_default_the_tenant() {
    let host = cloud_shell_host(&Account {
        name: String::from("bob"),
        tenant: None,
    });
    assert_eq!(host.user, "bob");
    assert_eq!(host.host, "default");
    assert_eq!(host.port, 0);
}
