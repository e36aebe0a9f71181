mod common;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bop_fap::region::{ColumnFamily, RegionId, data_page_id, encode_state};
use bop_fap::{
    FapRuntime, FapRuntimeOptions, FastAddPeerConfig, FastAddPeerContext, FastAddPeerResult,
    FastAddPeerScheduler, FastAddPeerStatus, FetchError, ManifestKey, MemoryObjectStore,
    RemoteObjectStore, ScheduleError, SchedulerConfig, StoreId, StoreResolver,
};

use common::{MockRegion, OfflineStore, ProducerStore, WriteCmdType, init_tracing};

fn owned_by(store_id: StoreId) -> Arc<dyn StoreResolver> {
    Arc::new(move |_region_id: RegionId| Some(store_id))
}

fn context(remote: Arc<dyn RemoteObjectStore>, resolver: Arc<dyn StoreResolver>) -> FastAddPeerContext {
    FastAddPeerContext::new(FastAddPeerConfig::default(), remote, resolver).expect("context")
}

fn restore(ctx: &FastAddPeerContext, region_id: RegionId) -> FastAddPeerResult {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let result = ctx.fast_add_peer(region_id);
        if result.status != FastAddPeerStatus::WaitForData {
            return result;
        }
        if !ctx.scheduler().is_scheduled(region_id) {
            // Completed with WaitForData and already consumed.
            return result;
        }
        assert!(Instant::now() < deadline, "restore of region {region_id} timed out");
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn restores_region_from_checkpoint_at_sequence_1000() {
    init_tracing();
    let remote = Arc::new(MemoryObjectStore::new());
    assert!(remote.create_bucket_if_absent("fap"));
    assert!(remote.create_bucket_if_absent("fap"));

    let producer = ProducerStore::open(1, remote.clone());
    let mut region = MockRegion::bootstrap(1, 1, 2);
    region.add_learner_peer(1, 2);
    region.normal_write(
        6,
        &[34],
        &["v2"],
        &[WriteCmdType::Put],
        &[ColumnFamily::Default],
    );
    assert!(region.needs_flush());
    assert!(region.try_flush(&producer.store));
    assert!(!region.needs_flush());
    region.persist_meta(&producer.store);

    let outcome = producer.dump(1000);
    assert_eq!(outcome.manifest_key, ManifestKey::new(1, 1000));

    let ctx = context(remote, owned_by(1));
    let result = restore(&ctx, 1);
    assert_eq!(result.status, FastAddPeerStatus::Ok);
    assert_eq!(result.decode_apply_state().unwrap(), region.apply_state);
    assert_eq!(result.decode_local_state().unwrap(), region.local_state);
    assert_eq!(result.apply_state, encode_state(&region.apply_state).unwrap());
    assert_eq!(result.local_state, encode_state(&region.local_state).unwrap());

    let learner = result
        .decode_local_state()
        .unwrap()
        .region
        .peer_on_store(2)
        .cloned()
        .expect("learner peer restored");
    assert_eq!(learner.id, 1);

    let view = ctx.temp_page_store(1, 1000).expect("current view cached");
    let page = view
        .read(&data_page_id(ColumnFamily::Default, b"34"))
        .expect("user data present");
    assert_eq!(&page.data[..], b"v2");
    assert!(ctx.temp_page_store(1, 999).is_some());
    assert!(ctx.temp_page_store(1, 1001).is_none());
}

#[test]
fn thread_pool_delivers_each_result_once() {
    init_tracing();
    let runtime = FapRuntime::create(FapRuntimeOptions::default()).expect("runtime");
    let scheduler = FastAddPeerScheduler::new(
        runtime.clone(),
        SchedulerConfig {
            pool_size: 2,
            queue_capacity: 16,
        },
    );

    for task_id in 0..5u64 {
        if !scheduler.is_scheduled(task_id) {
            scheduler
                .add_task(
                    task_id,
                    Box::new(move || {
                        thread::sleep(Duration::from_millis(20));
                        FastAddPeerResult::ok(task_id.to_le_bytes().to_vec(), Vec::new())
                    }),
                )
                .expect("schedule");
        }
        assert_eq!(
            scheduler
                .add_task(task_id, Box::new(|| FastAddPeerResult::ok(Vec::new(), Vec::new())))
                .unwrap_err(),
            ScheduleError::AlreadyScheduled(task_id)
        );
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    for task_id in 0..5u64 {
        while !scheduler.is_ready(task_id) {
            assert!(Instant::now() < deadline, "task {task_id} never became ready");
            thread::sleep(Duration::from_millis(5));
        }
        let result = scheduler.fetch_result(task_id).expect("fetch");
        assert_eq!(result.apply_state, task_id.to_le_bytes().to_vec());
        assert_eq!(
            scheduler.fetch_result(task_id).unwrap_err(),
            FetchError::NotReady(task_id)
        );
        assert!(!scheduler.is_scheduled(task_id));
    }
    assert_eq!(scheduler.snapshot().completed, 5);
    scheduler.shutdown();
}

#[test]
fn restore_uses_latest_published_checkpoint() {
    init_tracing();
    let remote = Arc::new(MemoryObjectStore::new());
    let producer = ProducerStore::open(7, remote.clone());
    let mut region = MockRegion::bootstrap(3, 7, 1);

    let mut expected = None;
    for sequence in [997, 998, 1000] {
        region.normal_write(
            8,
            &[sequence],
            &["value"],
            &[WriteCmdType::Put],
            &[ColumnFamily::Write],
        );
        assert!(region.try_flush(&producer.store));
        producer.dump(sequence);
        expected = Some(region.apply_state);
    }

    let ctx = context(remote, owned_by(7));
    let latest = ctx.catalog().list_manifests(7).unwrap().latest_manifest_key();
    assert_eq!(latest, Some(ManifestKey::new(7, 1000)));

    let result = restore(&ctx, 3);
    assert!(result.is_ok());
    assert_eq!(Some(result.decode_apply_state().unwrap()), expected);
    assert_eq!(ctx.cache().current_sequence(7), Some(1000));
}

#[test]
fn window_keeps_current_and_previous_sequence_only() {
    init_tracing();
    let remote = Arc::new(MemoryObjectStore::new());
    let producer = ProducerStore::open(4, remote.clone());
    let region = MockRegion::bootstrap(9, 4, 1);
    for sequence in [10, 11, 12] {
        region.persist_meta(&producer.store);
        producer.dump(sequence);
    }

    let ctx = context(remote, owned_by(4));
    let view_10 = ctx
        .reuse_or_create_temp_page_store(&ManifestKey::new(4, 10))
        .unwrap();
    ctx.reuse_or_create_temp_page_store(&ManifestKey::new(4, 11))
        .unwrap();
    assert_eq!(ctx.temp_page_store(4, 10).unwrap().sequence(), 10);
    assert!(ctx.temp_page_store(4, 12).is_none());

    ctx.reuse_or_create_temp_page_store(&ManifestKey::new(4, 12))
        .unwrap();
    assert_eq!(ctx.temp_page_store(4, 12).unwrap().sequence(), 12);
    assert_eq!(ctx.temp_page_store(4, 11).unwrap().sequence(), 11);
    assert!(ctx.temp_page_store(4, 10).is_none());
    assert!(ctx.temp_page_store(4, 13).is_none());

    // An evicted view stays readable for the job still holding it.
    assert_eq!(view_10.sequence(), 10);
    assert!(view_10.page_count() > 0);

    // Building an older sequence never moves the window back.
    let rebuilt = ctx
        .reuse_or_create_temp_page_store(&ManifestKey::new(4, 10))
        .unwrap();
    assert_eq!(rebuilt.sequence(), 10);
    assert_eq!(ctx.cache().current_sequence(4), Some(12));
    assert!(ctx.temp_page_store(4, 10).is_none());
}

#[test]
fn catalog_outage_reports_wait_for_data() {
    init_tracing();
    let ctx = context(Arc::new(OfflineStore), owned_by(1));
    let result = restore(&ctx, 1);
    assert_eq!(result.status, FastAddPeerStatus::WaitForData);
    assert!(!ctx.scheduler().is_scheduled(1));
}

#[test]
fn unknown_region_owner_has_no_suitable_checkpoint() {
    init_tracing();
    let resolver: Arc<dyn StoreResolver> = Arc::new(|_region_id: RegionId| None::<StoreId>);
    let ctx = context(Arc::new(MemoryObjectStore::new()), resolver);
    assert_eq!(
        restore(&ctx, 42).status,
        FastAddPeerStatus::NoSuitableCheckpoint
    );
}
