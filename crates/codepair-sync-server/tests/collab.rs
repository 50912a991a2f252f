//! End-to-end collaboration through an in-process relay.

use std::time::Duration;

use codepair_common::execute::SimulatedSandbox;
use codepair_common::service::{MemorySessionService, SessionService};
use codepair_common::transport::ConnectionPool;
use codepair_common::{ClientConfig, Language, ServiceError, ValidationError};
use codepair_editor_core::{EditorSurface, Selection};
use codepair_editor_crdt::{CrdtError, SessionClient};
use codepair_sync_server::{LocalConnector, Relay};

type Client = SessionClient<MemorySessionService>;

fn config() -> ClientConfig {
    ClientConfig {
        reconnect_interval: Duration::from_secs(1),
        ..ClientConfig::default()
    }
}

async fn join(
    service: &MemorySessionService,
    connector: &LocalConnector,
    session_id: &str,
    username: &str,
) -> Result<Client, CrdtError> {
    let pool = ConnectionPool::new(connector.clone(), config().transport());
    join_with(service, &pool, session_id, username, &config()).await
}

async fn join_with(
    service: &MemorySessionService,
    pool: &ConnectionPool,
    session_id: &str,
    username: &str,
    config: &ClientConfig,
) -> Result<Client, CrdtError> {
    SessionClient::join(
        service.clone(),
        pool,
        session_id,
        username,
        Default::default(),
        config,
    )
    .await
}

/// Let background tasks run and feed every client what arrived.
async fn settle(clients: &mut [&mut Client], rounds: usize) {
    for _ in 0..rounds {
        tokio::time::sleep(Duration::from_millis(5)).await;
        for client in clients.iter_mut() {
            client.pump().await;
        }
    }
}

async fn type_at_end(client: &mut Client, text: &str) {
    let end = client.surface().text().chars().count();
    client.surface_mut().set_selection(Selection::collapsed(end));
    client.type_text(text).await.unwrap();
}

struct Setup {
    relay: Relay,
    connector: LocalConnector,
    service: MemorySessionService,
    session_id: String,
}

async fn setup() -> Setup {
    let relay = Relay::new();
    let connector = LocalConnector::new(relay.clone());
    let service = MemorySessionService::default();
    let session = service
        .create_session(Some(Language::new("python")))
        .await
        .unwrap();
    Setup {
        relay,
        connector,
        service,
        session_id: session.id.to_string(),
    }
}

#[tokio::test(start_paused = true)]
async fn test_late_joiner_sees_shared_text() {
    let Setup {
        relay,
        connector,
        service,
        session_id,
    } = setup().await;
    let template = Language::new("python").template().unwrap_or_default();

    let mut ada = join(&service, &connector, &session_id, "ada").await.unwrap();
    settle(&mut [&mut ada], 20).await;
    assert!(ada.state().is_active());
    assert_eq!(ada.text(), template);
    assert_eq!(ada.surface().text(), template);
    assert_eq!(ada.surface().language(), "python");

    type_at_end(&mut ada, "x = 1\n").await;
    // Joining while ada's typing snapshot is still in flight.
    let mut grace = join(&service, &connector, &session_id, "grace").await.unwrap();
    settle(&mut [&mut ada, &mut grace], 20).await;

    let expected = format!("{template}x = 1\n");
    assert!(grace.state().is_active());
    assert_eq!(grace.text(), expected);
    assert_eq!(grace.surface().text(), expected);
    assert_eq!(relay.room_text(&session_id), Some(expected.clone()));
    assert_eq!(service.get_session(&session_id).await.unwrap().code, expected);

    // Further remote edits reach the surface as targeted inserts.
    let before = grace.surface().text();
    type_at_end(&mut ada, "y = 2\n").await;
    settle(&mut [&mut ada, &mut grace], 20).await;

    assert_eq!(grace.surface().text(), format!("{expected}y = 2\n"));
    let last = grace.surface().applied_batches().last().unwrap();
    assert!(!last.is_full_replace(&before));
    assert!(last.iter().all(|edit| edit.is_insert()));
    assert_eq!(grace.online_ids().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_offline_edits_converge_after_reconnect() {
    let Setup {
        relay,
        connector,
        service,
        session_id,
    } = setup().await;
    let mut ada = join(&service, &connector, &session_id, "ada").await.unwrap();
    let mut grace = join(&service, &connector, &session_id, "grace").await.unwrap();
    settle(&mut [&mut ada, &mut grace], 20).await;
    assert!(ada.state().is_active() && grace.state().is_active());

    connector.set_online(false);
    connector.drop_connections();
    settle(&mut [&mut ada, &mut grace], 20).await;
    assert!(ada.state().offline_reason().is_some());
    assert!(grace.state().offline_reason().is_some());
    assert!(ada.online().is_empty());

    type_at_end(&mut ada, "a = 1\n").await;
    grace.surface_mut().set_selection(Selection::collapsed(0));
    grace.type_text("# grace\n").await.unwrap();
    assert_ne!(ada.text(), grace.text());

    connector.set_online(true);
    // Reconnects happen on the fixed interval.
    settle(&mut [&mut ada, &mut grace], 400).await;

    assert!(ada.state().is_active() && grace.state().is_active());
    assert_eq!(ada.text(), grace.text());
    assert_eq!(ada.surface().text(), grace.surface().text());
    assert!(ada.text().starts_with("# grace\n"));
    assert!(ada.text().ends_with("a = 1\n"));
    assert_eq!(relay.room_text(&session_id), Some(ada.text()));
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_username_rejected() {
    let Setup {
        relay,
        connector,
        service,
        session_id,
    } = setup().await;
    let mut ada = join(&service, &connector, &session_id, "ada").await.unwrap();
    settle(&mut [&mut ada], 20).await;

    let err = join(&service, &connector, &session_id, " ADA ")
        .await
        .err()
        .unwrap();
    assert!(matches!(
        err,
        CrdtError::Service(ServiceError::Validation(ValidationError::UsernameTaken { .. }))
    ));
    assert!(!service.check_username(&session_id, "Ada").await.unwrap());

    settle(&mut [&mut ada], 20).await;
    assert_eq!(service.get_session(&session_id).await.unwrap().users.len(), 1);
    assert_eq!(relay.connection_count(&session_id), 1);
    assert_eq!(ada.online_ids().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_typing_presence_clears_after_quiet_period() {
    let Setup {
        connector,
        service,
        session_id,
        ..
    } = setup().await;
    let mut ada = join(&service, &connector, &session_id, "ada").await.unwrap();
    let mut grace = join(&service, &connector, &session_id, "grace").await.unwrap();
    settle(&mut [&mut ada, &mut grace], 20).await;

    type_at_end(&mut ada, "z").await;
    settle(&mut [&mut ada, &mut grace], 10).await;

    let ada_id = ada.participant().id.clone();
    let seen = grace.online();
    let ada_seen = seen.iter().find(|p| p.participant_id == ada_id).unwrap();
    assert!(ada_seen.is_typing);
    assert!(ada.is_typing());
    let stored = service.get_session(&session_id).await.unwrap();
    assert!(stored.participant(&ada_id).unwrap().is_typing);

    settle(&mut [&mut ada, &mut grace], 200).await;
    assert!(!ada.is_typing());
    assert!(grace.online().iter().all(|p| !p.is_typing));
    let stored = service.get_session(&session_id).await.unwrap();
    assert!(!stored.participant(&ada_id).unwrap().is_typing);
}

#[tokio::test(start_paused = true)]
async fn test_execution_result_and_language_shared() {
    let Setup {
        connector,
        service,
        session_id,
        ..
    } = setup().await;
    let mut ada = join(&service, &connector, &session_id, "ada").await.unwrap();
    let mut grace = join(&service, &connector, &session_id, "grace").await.unwrap();
    settle(&mut [&mut ada, &mut grace], 20).await;

    let shared = ada.run(&SimulatedSandbox).await.unwrap();
    assert!(shared.result.output.starts_with("[Simulated Python Output]"));
    settle(&mut [&mut ada, &mut grace], 20).await;
    assert_eq!(grace.latest_result(), Some(shared));

    grace.set_language(Language::new("javascript")).await.unwrap();
    settle(&mut [&mut ada, &mut grace], 20).await;
    assert_eq!(ada.language(), Language::new("javascript"));
    assert_eq!(ada.surface().language(), "javascript");
    assert_eq!(
        service.get_session(&session_id).await.unwrap().language,
        Language::new("javascript")
    );
}

#[tokio::test(start_paused = true)]
async fn test_leave_withdraws_presence_and_roster() {
    let Setup {
        relay,
        connector,
        service,
        session_id,
    } = setup().await;
    let mut ada = join(&service, &connector, &session_id, "ada").await.unwrap();
    let mut grace = join(&service, &connector, &session_id, "grace").await.unwrap();
    settle(&mut [&mut ada, &mut grace], 20).await;
    assert_eq!(ada.online_ids().len(), 2);

    grace.leave().await.unwrap();
    settle(&mut [&mut ada], 20).await;

    assert_eq!(ada.online_ids().len(), 1);
    assert_eq!(relay.connection_count(&session_id), 1);
    let stored = service.get_session(&session_id).await.unwrap();
    assert_eq!(stored.users.len(), 1);
    assert_eq!(stored.users[0].username, "ada");
}

#[tokio::test(start_paused = true)]
async fn test_lone_typist_keeps_text_through_metadata_snapshots() {
    let Setup {
        relay,
        connector,
        service,
        session_id,
    } = setup().await;
    let template = Language::new("python").template().unwrap_or_default();
    // Without persistence every snapshot carries the original template.
    let config = ClientConfig {
        persist_text: false,
        ..config()
    };
    let pool = ConnectionPool::new(connector.clone(), config.transport());
    let mut ada = join_with(&service, &pool, &session_id, "ada", &config)
        .await
        .unwrap();
    settle(&mut [&mut ada], 20).await;

    type_at_end(&mut ada, "x = 1\n").await;
    let expected = format!("{template}x = 1\n");
    assert_eq!(ada.text(), expected);

    // Roster and typing changes from elsewhere arrive with stale code.
    service.join_session(&session_id, "observer").await.unwrap();
    settle(&mut [&mut ada], 20).await;
    assert_eq!(ada.text(), expected);

    type_at_end(&mut ada, "y = 2\n").await;
    settle(&mut [&mut ada], 200).await;
    assert!(!ada.is_typing());

    let expected = format!("{expected}y = 2\n");
    assert_eq!(ada.text(), expected);
    assert_eq!(ada.surface().text(), expected);
    assert_eq!(relay.room_text(&session_id), Some(expected));
    assert_eq!(service.get_session(&session_id).await.unwrap().code, template);
}

#[tokio::test(start_paused = true)]
async fn test_clients_sharing_a_pool_see_each_other() {
    let Setup {
        relay,
        connector,
        service,
        session_id,
    } = setup().await;
    let template = Language::new("python").template().unwrap_or_default();
    let pool = ConnectionPool::new(connector.clone(), config().transport());
    let mut ada = join_with(&service, &pool, &session_id, "ada", &config())
        .await
        .unwrap();
    let mut grace = join_with(&service, &pool, &session_id, "grace", &config())
        .await
        .unwrap();
    settle(&mut [&mut ada, &mut grace], 20).await;

    assert!(ada.state().is_active() && grace.state().is_active());
    assert_eq!(relay.connection_count(&session_id), 1);
    assert_eq!(ada.text(), template);
    assert_eq!(grace.text(), template);
    assert_eq!(relay.room_text(&session_id).as_deref(), Some(template));

    type_at_end(&mut ada, "a = 1\n").await;
    settle(&mut [&mut ada, &mut grace], 20).await;
    type_at_end(&mut grace, "g = 2\n").await;
    settle(&mut [&mut ada, &mut grace], 20).await;

    let expected = format!("{template}a = 1\ng = 2\n");
    assert_eq!(ada.text(), expected);
    assert_eq!(grace.text(), expected);
    assert_eq!(grace.surface().text(), expected);
    assert_eq!(relay.room_text(&session_id), Some(expected.clone()));
    assert_eq!(expected.matches("Hello Python").count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_rejoin_after_outage_keeps_single_copy() {
    let Setup {
        relay,
        connector,
        service,
        session_id,
    } = setup().await;
    let template = Language::new("python").template().unwrap_or_default();
    let mut ada = join(&service, &connector, &session_id, "ada").await.unwrap();
    settle(&mut [&mut ada], 20).await;
    type_at_end(&mut ada, "x = 1\n").await;
    settle(&mut [&mut ada], 20).await;

    // Only ada's link goes down; grace arrives through a healthy one.
    connector.set_online(false);
    connector.drop_connections();
    settle(&mut [&mut ada], 20).await;
    assert_eq!(relay.connection_count(&session_id), 0);

    let other = LocalConnector::new(relay.clone());
    let mut grace = join(&service, &other, &session_id, "grace").await.unwrap();
    settle(&mut [&mut ada, &mut grace], 20).await;
    let expected = format!("{template}x = 1\n");
    assert_eq!(grace.text(), expected);

    connector.set_online(true);
    settle(&mut [&mut ada, &mut grace], 400).await;

    assert!(ada.state().is_active());
    assert_eq!(ada.text(), expected);
    assert_eq!(grace.text(), expected);
    assert_eq!(relay.room_text(&session_id), Some(expected));
}

#[tokio::test(start_paused = true)]
async fn test_rest_update_during_outage_reaches_everyone() {
    let Setup {
        relay,
        connector,
        service,
        session_id,
    } = setup().await;
    let other = LocalConnector::new(relay.clone());
    let mut ada = join(&service, &connector, &session_id, "ada").await.unwrap();
    let mut grace = join(&service, &other, &session_id, "grace").await.unwrap();
    settle(&mut [&mut ada, &mut grace], 20).await;

    connector.set_online(false);
    connector.drop_connections();
    settle(&mut [&mut ada, &mut grace], 20).await;
    assert!(ada.state().offline_reason().is_some());

    service
        .update_code(&session_id, "print('rest')\n", "rest-client")
        .await
        .unwrap();
    settle(&mut [&mut ada, &mut grace], 20).await;
    assert_eq!(grace.text(), "print('rest')\n");

    connector.set_online(true);
    settle(&mut [&mut ada, &mut grace], 400).await;

    assert!(ada.state().is_active());
    assert_eq!(ada.text(), "print('rest')\n");
    assert_eq!(ada.surface().text(), "print('rest')\n");
    assert_eq!(relay.room_text(&session_id).as_deref(), Some("print('rest')\n"));
}
