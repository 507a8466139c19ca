mod common;

use std::collections::BTreeSet;
use std::time::Duration;

use common::*;
use replistore::placement::FileStatus;

#[tokio::test]
async fn test_store_list_remove_with_two_replicas() {
    let (controller, port) = start_controller(2, 500, 60_000).await;
    let a = FakeDstore::join(port).await;
    let b = FakeDstore::join(port).await;
    let c = FakeDstore::join(port).await;
    wait_for_nodes(&controller, 3).await;

    let mut client = Line::connect(port).await;
    assert_eq!(client.request("LIST").await, "LIST");

    let chosen = store_with_fakes(&mut client, &[&a, &b, &c], "notes.txt", 10).await;
    let distinct: BTreeSet<_> = chosen.iter().copied().collect();
    assert_eq!(distinct.len(), 2);

    assert_eq!(client.request("LIST").await, "LIST notes.txt");
    let record = controller.file_record("notes.txt").await.unwrap();
    assert_eq!(record.status(), FileStatus::StoreComplete);
    assert_eq!(record.replicas(), &distinct);

    assert_eq!(client.request("REMOVE notes.txt").await, "REMOVE_COMPLETE");
    assert_eq!(client.request("LIST").await, "LIST");
    assert!(controller.file_record("notes.txt").await.is_none());
    for fake in [&a, &b, &c] {
        assert!(fake.files().is_empty());
    }
}

#[tokio::test]
async fn test_store_picks_exactly_r_of_five_dstores() {
    let (controller, port) = start_controller(3, 500, 60_000).await;
    let mut fakes = Vec::new();
    for _ in 0..5 {
        fakes.push(FakeDstore::join(port).await);
    }
    wait_for_nodes(&controller, 5).await;

    let mut client = Line::connect(port).await;
    let all: Vec<&FakeDstore> = fakes.iter().collect();
    for name in ["a.txt", "b.txt"] {
        let chosen = store_with_fakes(&mut client, &all, name, 1).await;
        let record = controller.file_record(name).await.unwrap();
        assert_eq!(chosen.len(), 3);
        assert_eq!(record.replicas().len(), 3);
        assert_eq!(record.status(), FileStatus::StoreComplete);
    }

    // Selection prefers the nodes holding the least.
    let loads: Vec<usize> = fakes.iter().map(|fake| fake.files().len()).collect();
    assert_eq!(loads.iter().sum::<usize>(), 6);
    assert!(loads.iter().all(|load| (1..=2).contains(load)));
}

#[tokio::test]
async fn test_rejects_requests_without_enough_dstores() {
    let (controller, port) = start_controller(2, 500, 60_000).await;
    let mut client = Line::connect(port).await;
    assert_eq!(client.request("LIST").await, "ERROR_NOT_ENOUGH_DSTORES");

    let _a = FakeDstore::join(port).await;
    wait_for_nodes(&controller, 1).await;
    assert_eq!(client.request("STORE f 1").await, "ERROR_NOT_ENOUGH_DSTORES");
    assert_eq!(client.request("LOAD f").await, "ERROR_NOT_ENOUGH_DSTORES");
    assert!(controller.file_names().await.is_empty());
}

#[tokio::test]
async fn test_duplicate_store_rejected_until_removed() {
    let (controller, port) = start_controller(2, 500, 60_000).await;
    let a = FakeDstore::join(port).await;
    let b = FakeDstore::join(port).await;
    wait_for_nodes(&controller, 2).await;

    let mut client = Line::connect(port).await;
    store_with_fakes(&mut client, &[&a, &b], "dup", 4).await;
    assert_eq!(client.request("STORE dup 4").await, "ERROR_FILE_ALREADY_EXISTS");

    assert_eq!(client.request("REMOVE dup").await, "REMOVE_COMPLETE");
    assert_eq!(client.request("REMOVE dup").await, "ERROR_FILE_DOES_NOT_EXIST");
    store_with_fakes(&mut client, &[&a, &b], "dup", 4).await;
}

#[tokio::test]
async fn test_store_in_progress_is_invisible() {
    let (controller, port) = start_controller(2, 2_000, 60_000).await;
    let a = FakeDstore::join(port).await;
    let b = FakeDstore::join(port).await;
    wait_for_nodes(&controller, 2).await;

    let mut writer = Line::connect(port).await;
    let chosen = store_targets(&writer.request("STORE pending 3").await);
    assert_eq!(chosen.len(), 2);

    let mut other = Line::connect(port).await;
    assert_eq!(other.request("LIST").await, "LIST");
    assert_eq!(other.request("LOAD pending").await, "ERROR_FILE_DOES_NOT_EXIST");
    assert_eq!(other.request("REMOVE pending").await, "ERROR_FILE_DOES_NOT_EXIST");
    assert_eq!(other.request("STORE pending 3").await, "ERROR_FILE_ALREADY_EXISTS");

    a.ack_store("pending").await;
    b.ack_store("pending").await;
    assert_eq!(writer.recv().await, "STORE_COMPLETE");
    assert_eq!(other.request("LIST").await, "LIST pending");
}

#[tokio::test]
async fn test_store_without_quorum_is_rolled_back() {
    let (controller, port) = start_controller(2, 300, 60_000).await;
    let a = FakeDstore::join(port).await;
    let _b = FakeDstore::join(port).await;
    wait_for_nodes(&controller, 2).await;

    let mut client = Line::connect(port).await;
    let chosen = store_targets(&client.request("STORE partial 8").await);
    assert!(chosen.contains(&a.id));
    a.ack_store("partial").await;

    assert_eq!(client.recv_within(Duration::from_millis(800)).await, None);
    assert!(controller.file_record("partial").await.is_none());
    assert_eq!(client.request("LIST").await, "LIST");

    // The name is free again.
    let again = store_targets(&client.request("STORE partial 8").await);
    assert_eq!(again.len(), 2);
}

#[tokio::test]
async fn test_load_cycles_through_replicas() {
    let (controller, port) = start_controller(2, 500, 60_000).await;
    let a = FakeDstore::join(port).await;
    let b = FakeDstore::join(port).await;
    wait_for_nodes(&controller, 2).await;

    let mut client = Line::connect(port).await;
    let mut chosen = store_with_fakes(&mut client, &[&a, &b], "data.bin", 42).await;
    chosen.sort();

    assert_eq!(client.request("LOAD missing").await, "ERROR_FILE_DOES_NOT_EXIST");

    let first = format!("LOAD_FROM {} 42", chosen[0]);
    let second = format!("LOAD_FROM {} 42", chosen[1]);
    assert_eq!(client.request("LOAD data.bin").await, first);
    assert_eq!(client.request("RELOAD data.bin").await, second);
    assert_eq!(client.request("RELOAD data.bin").await, "ERROR_FILE_DOES_NOT_EXIST");

    // A fresh LOAD starts over.
    assert_eq!(client.request("LOAD data.bin").await, first);

    // Cursors are per connection.
    let mut other = Line::connect(port).await;
    assert_eq!(other.request("LOAD data.bin").await, first);
    assert_eq!(client.request("RELOAD data.bin").await, second);
}

#[tokio::test]
async fn test_dead_dstore_is_dropped_from_replica_sets() {
    let (controller, port) = start_controller(2, 500, 60_000).await;
    let a = FakeDstore::join(port).await;
    let b = FakeDstore::join(port).await;
    let c = FakeDstore::join(port).await;
    wait_for_nodes(&controller, 3).await;

    let mut client = Line::connect(port).await;
    let chosen = store_with_fakes(&mut client, &[&a, &b, &c], "fragile", 5).await;

    let mut fakes = vec![a, b, c];
    let victim_at = fakes.iter().position(|fake| fake.id == chosen[0]).unwrap();
    let victim = fakes.remove(victim_at);
    let victim_id = victim.id;
    victim.kill().await;

    let controller_ref = &controller;
    let cleaned = wait_until(REPLY_TIMEOUT, move || async move {
        let gone = !controller_ref.live_nodes().await.contains(&victim_id);
        let record = controller_ref.file_record("fragile").await;
        gone && record.map_or(false, |r| !r.replicas().contains(&victim_id))
    })
    .await;
    assert!(cleaned, "dead node still referenced");

    let record = controller.file_record("fragile").await.unwrap();
    assert_eq!(record.status(), FileStatus::StoreComplete);
    assert_eq!(record.replicas().len(), 1);
    assert_eq!(
        client.request("LOAD fragile").await,
        format!("LOAD_FROM {} 5", chosen[1])
    );
}

#[tokio::test]
async fn test_unacknowledged_remove_is_finished_by_rebalance() {
    let (controller, port) = start_controller(2, 300, 60_000).await;
    let a = FakeDstore::join(port).await;
    let b = FakeDstore::join(port).await;
    wait_for_nodes(&controller, 2).await;

    let mut client = Line::connect(port).await;
    store_with_fakes(&mut client, &[&a, &b], "stubborn", 7).await;

    b.answer_removes(false);
    client.send("REMOVE stubborn").await;
    assert_eq!(client.recv_within(Duration::from_millis(800)).await, None);

    let record = controller.file_record("stubborn").await.unwrap();
    assert_eq!(record.status(), FileStatus::RemoveInProgress);
    assert_eq!(record.replicas(), &BTreeSet::from([b.id]));
    assert_eq!(client.request("LIST").await, "LIST");
    assert_eq!(client.request("STORE stubborn 7").await, "ERROR_FILE_ALREADY_EXISTS");

    controller.trigger_rebalance();
    let controller_ref = &controller;
    let finished = wait_until(REPLY_TIMEOUT, move || async move {
        controller_ref.file_record("stubborn").await.is_none()
    })
    .await;
    assert!(finished, "rebalance left the removal unfinished");
    assert!(b.files().is_empty());

    b.answer_removes(true);
    store_with_fakes(&mut client, &[&a, &b], "stubborn", 7).await;
}

#[tokio::test]
async fn test_requests_during_rebalance_run_in_arrival_order() {
    let (controller, port) = start_controller(2, 2_000, 60_000).await;
    let a = FakeDstore::join(port).await;
    let b = FakeDstore::join(port).await;
    wait_for_nodes(&controller, 2).await;

    let mut setup = Line::connect(port).await;
    store_with_fakes(&mut setup, &[&a, &b], "shared", 3).await;

    let mut first = Line::connect(port).await;
    let mut second = Line::connect(port).await;
    let mut third = Line::connect(port).await;

    a.set_list_delay(Duration::from_millis(500));
    b.set_list_delay(Duration::from_millis(500));
    controller.trigger_rebalance();
    let controller_ref = &controller;
    assert!(
        wait_until(REPLY_TIMEOUT, move || async move { controller_ref.is_rebalancing().await }).await
    );

    first.send("LIST").await;
    sleep_briefly().await;
    second.send("REMOVE shared").await;
    sleep_briefly().await;
    third.send("LIST").await;

    assert_eq!(first.recv().await, "LIST shared");
    assert_eq!(second.recv().await, "REMOVE_COMPLETE");
    assert_eq!(third.recv().await, "LIST");
    assert!(
        wait_until(REPLY_TIMEOUT, move || async move { !controller_ref.is_rebalancing().await }).await
    );
}

async fn sleep_briefly() {
    tokio::time::sleep(Duration::from_millis(30)).await;
}

#[tokio::test]
async fn test_rebalance_proceeds_without_slow_lister() {
    let (controller, port) = start_controller(2, 300, 60_000).await;
    let a = FakeDstore::join(port).await;
    let b = FakeDstore::join(port).await;
    let c = FakeDstore::join(port).await;
    wait_for_nodes(&controller, 3).await;

    let mut client = Line::connect(port).await;
    let chosen = store_with_fakes(&mut client, &[&a, &b, &c], "tardy", 2).await;
    let fakes = [&a, &b, &c];
    let slow = fakes.iter().find(|fake| fake.id == chosen[0]).unwrap();
    let spare = fakes.iter().find(|fake| !chosen.contains(&fake.id)).unwrap();

    slow.set_list_delay(Duration::from_millis(1_000));
    controller.trigger_rebalance();

    // Only the two prompt nodes count, so the copy on the slow one is not seen.
    let expected = BTreeSet::from([chosen[1], spare.id]);
    let controller_ref = &controller;
    let expected_ref = &expected;
    let settled = wait_until(REPLY_TIMEOUT, move || async move {
        let record = controller_ref.file_record("tardy").await;
        let placed = record.map_or(false, |r| r.replicas() == expected_ref);
        placed && !controller_ref.is_rebalancing().await
    })
    .await;
    assert!(settled, "cycle waited on the slow node");

    assert!(controller.live_nodes().await.contains(&slow.id));
    assert!(slow.files().contains("tardy"));
    assert_eq!(client.request("LIST").await, "LIST tardy");
}
