use futures::executor::block_on;
use futures::FutureExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use vbd_core::{
    Backend, BackendConfig, BdevErrorKind, BdevResult, Device, DeviceState, IoChannel,
    IoCompletion, RequestId, SgList,
};
use vbd_volumes::{MemoryVolume, MemoryVolumeClient};

const MIB: u64 = 1024 * 1024;

#[derive(Clone, Default)]
struct Recorder {
    done: Arc<Mutex<Vec<IoCompletion>>>,
}

impl Recorder {
    fn callback(&self) -> impl FnOnce(IoCompletion) + Send + 'static {
        let done = self.done.clone();
        move |completion| done.lock().unwrap().push(completion)
    }

    fn take(&self) -> Vec<IoCompletion> {
        std::mem::take(&mut *self.done.lock().unwrap())
    }

    fn len(&self) -> usize {
        self.done.lock().unwrap().len()
    }
}

#[derive(Clone, Default)]
struct DeleteOutcome {
    calls: Arc<AtomicUsize>,
    result: Arc<Mutex<Option<BdevResult<()>>>>,
}

impl DeleteOutcome {
    fn callback(&self) -> impl FnOnce(BdevResult<()>) + Send + 'static {
        let calls = self.calls.clone();
        let result = self.result.clone();
        move |res| {
            calls.fetch_add(1, Ordering::SeqCst);
            *result.lock().unwrap() = Some(res);
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn succeeded(&self) -> bool {
        matches!(*self.result.lock().unwrap(), Some(Ok(())))
    }
}

fn setup(size: u64, config: BackendConfig) -> (Backend, MemoryVolume) {
    let client = MemoryVolumeClient::new();
    let image = client.create_image("rbd", "disk0", size).unwrap();
    let backend = Backend::new(Arc::new(client), config).unwrap();
    (backend, image)
}

fn create(backend: &Backend, block_size: u32) -> Device {
    block_on(backend.create_device("vbd0", "rbd", "disk0", block_size)).unwrap()
}

#[test]
fn write_read_then_delete_while_read_in_flight() {
    let (backend, image) = setup(MIB, BackendConfig::default());
    let device = create(&backend, 512);
    assert_eq!(device.block_count(), 2048);
    assert_eq!(device.state(), DeviceState::Active);

    let mut channel = device.open_channel().unwrap();
    let recorder = Recorder::default();

    device
        .write(
            &mut channel,
            SgList::from(vec![0xa5u8; 512]),
            0,
            512,
            recorder.callback(),
        )
        .unwrap();
    assert_eq!(channel.poll(), 1);
    let writes = recorder.take();
    assert!(writes[0].is_success());

    image.pause();
    device
        .read(&mut channel, SgList::zeroed(512), 0, 512, recorder.callback())
        .unwrap();
    assert_eq!(channel.poll(), 0);
    assert_eq!(channel.inflight_len(), 1);

    let outcome = DeleteOutcome::default();
    let mut task = backend
        .delete_device(&device, outcome.callback())
        .unwrap();
    assert_eq!(device.state(), DeviceState::Deleting);
    assert!((&mut task).now_or_never().is_none());

    let err = device
        .read(&mut channel, SgList::zeroed(512), 0, 512, recorder.callback())
        .unwrap_err();
    assert_eq!(err.kind(), BdevErrorKind::DeviceDeleting);
    assert_eq!(
        device.open_channel().unwrap_err().kind(),
        BdevErrorKind::DeviceDeleting
    );

    image.resume();
    assert_eq!(channel.poll(), 1);
    let reads = recorder.take();
    assert_eq!(reads.len(), 1);
    assert!(reads[0].is_success());
    assert_eq!(reads[0].buffers.as_ref().unwrap().to_vec(), vec![0xa5u8; 512]);
    assert_eq!(outcome.calls(), 0);
    assert!(!image.is_closed());
    assert_eq!(image.open_queues(), 0);

    block_on(task);
    assert_eq!(outcome.calls(), 1);
    assert!(outcome.succeeded());
    assert!(image.is_closed());
    assert_eq!(device.state(), DeviceState::Deleted);
    assert_eq!(
        backend.get_device("vbd0").unwrap_err().kind(),
        BdevErrorKind::DeviceNotFound
    );

    let again = DeleteOutcome::default();
    let err = device.delete(again.callback()).unwrap_err();
    assert_eq!(err.kind(), BdevErrorKind::DeviceNotFound);
    assert_eq!(again.calls(), 0);
    assert_eq!(outcome.calls(), 1);
    assert_eq!(image.close_count(), 1);
}

#[test]
fn write_exactly_past_end_is_out_of_range() {
    let (backend, _image) = setup(MIB, BackendConfig::default());
    let device = create(&backend, 512);
    let mut channel = IoChannel::open(&device).unwrap();
    let recorder = Recorder::default();

    let end = device.block_count() * device.block_size() as u64;
    let err = device
        .write(
            &mut channel,
            SgList::from(vec![0u8; 512]),
            end,
            512,
            recorder.callback(),
        )
        .unwrap_err();
    assert_eq!(err.kind(), BdevErrorKind::OutOfRange);
    assert_eq!(channel.inflight_len(), 0);

    let err = device
        .unmap(&mut channel, u64::MAX, 2, recorder.callback())
        .unwrap_err();
    assert_eq!(err.kind(), BdevErrorKind::OutOfRange);
    assert_eq!(channel.poll(), 0);
    assert_eq!(recorder.len(), 0);
}

#[test]
fn closing_channel_cancels_pending_in_submission_order() {
    let (backend, image) = setup(MIB, BackendConfig::default());
    let device = create(&backend, 512);
    let mut channel = IoChannel::open(&device).unwrap();
    let recorder = Recorder::default();

    image.pause();
    let first = device
        .write(
            &mut channel,
            SgList::from(vec![1u8; 512]),
            0,
            512,
            recorder.callback(),
        )
        .unwrap();
    let second = device
        .read(&mut channel, SgList::zeroed(512), 512, 512, recorder.callback())
        .unwrap();
    assert_eq!(channel.inflight_len(), 2);
    assert_eq!(device.channel_count(), 1);

    channel.close();
    let done = recorder.take();
    let ids: Vec<RequestId> = done.iter().map(|c| c.id).collect();
    assert_eq!(ids, vec![first, second]);
    assert!(done
        .iter()
        .all(|c| c.error_kind() == Some(BdevErrorKind::Cancelled) && c.buffers.is_none()));
    assert_eq!(device.channel_count(), 0);
    assert_eq!(image.open_queues(), 0);
}

#[test]
fn dropping_channel_cancels_pending() {
    let (backend, image) = setup(MIB, BackendConfig::default());
    let device = create(&backend, 512);
    let recorder = Recorder::default();
    {
        let mut channel = IoChannel::open(&device).unwrap();
        image.pause();
        device
            .flush(&mut channel, 0, 0, recorder.callback())
            .unwrap();
    }
    let done = recorder.take();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].error_kind(), Some(BdevErrorKind::Cancelled));
}

#[test]
fn full_channel_reports_busy_without_tracking() {
    let (backend, image) = setup(
        MIB,
        BackendConfig {
            channel_capacity: 2,
        },
    );
    let device = create(&backend, 512);
    let mut channel = IoChannel::open(&device).unwrap();
    let recorder = Recorder::default();

    image.pause();
    device.flush(&mut channel, 0, 0, recorder.callback()).unwrap();
    device
        .unmap(&mut channel, 0, 4096, recorder.callback())
        .unwrap();
    let err = device
        .flush(&mut channel, 0, 0, recorder.callback())
        .unwrap_err();
    assert_eq!(err.kind(), BdevErrorKind::ChannelBusy);
    assert_eq!(channel.inflight_len(), 2);

    image.resume();
    assert_eq!(channel.poll(), 2);
    assert!(channel.is_idle());
    assert!(recorder.take().iter().all(IoCompletion::is_success));
    assert!(vbd_core::metrics::snapshot().busy_rejects >= 1);
}

#[test]
fn delete_while_deleting_is_rejected() {
    let (backend, image) = setup(MIB, BackendConfig::default());
    let device = create(&backend, 512);
    let mut channel = IoChannel::open(&device).unwrap();
    let recorder = Recorder::default();

    image.pause();
    device.flush(&mut channel, 0, 0, recorder.callback()).unwrap();

    let first = DeleteOutcome::default();
    let task = backend.delete_device(&device, first.callback()).unwrap();
    let second = DeleteOutcome::default();
    let err = backend
        .delete_device(&device, second.callback())
        .unwrap_err();
    assert_eq!(err.kind(), BdevErrorKind::DeviceDeleting);

    image.resume();
    channel.poll();
    block_on(task);
    assert_eq!(first.calls(), 1);
    assert_eq!(second.calls(), 0);
    assert_eq!(recorder.len(), 1);
}

#[test]
fn delete_without_channels_completes_immediately() {
    let (backend, image) = setup(MIB, BackendConfig::default());
    let device = create(&backend, 4096);
    let outcome = DeleteOutcome::default();
    let mut task = backend.delete_device(&device, outcome.callback()).unwrap();
    assert!(!task.is_finished());
    assert!((&mut task).now_or_never().is_some());
    assert!(task.is_finished());
    assert!((&mut task).now_or_never().is_some());
    assert_eq!(outcome.calls(), 1);
    assert!(outcome.succeeded());
    assert!(image.is_closed());
    assert!(backend.devices().is_empty());
}

#[test]
fn delete_only_progresses_while_task_is_polled() {
    let (backend, image) = setup(MIB, BackendConfig::default());
    let device = create(&backend, 512);
    let mut channel = device.open_channel().unwrap();
    let recorder = Recorder::default();

    image.pause();
    device
        .read(&mut channel, SgList::zeroed(512), 0, 512, recorder.callback())
        .unwrap();
    let outcome = DeleteOutcome::default();
    let mut task = backend.delete_device(&device, outcome.callback()).unwrap();
    assert!((&mut task).now_or_never().is_none());
    assert!(!task.is_finished());

    image.resume();
    assert_eq!(channel.poll(), 1);
    assert_eq!(outcome.calls(), 0);
    assert!(!image.is_closed());
    assert_eq!(device.state(), DeviceState::Deleting);

    drop(task);
    assert_eq!(outcome.calls(), 0);
    assert!(!image.is_closed());
    assert_eq!(device.state(), DeviceState::Deleting);
    assert_eq!(backend.devices().len(), 1);
    assert_eq!(recorder.take().len(), 1);
}

#[test]
fn dropping_channel_during_delete_releases_device() {
    let (backend, image) = setup(MIB, BackendConfig::default());
    let device = create(&backend, 512);
    let mut channel = IoChannel::open(&device).unwrap();
    let recorder = Recorder::default();

    image.pause();
    device
        .read(&mut channel, SgList::zeroed(512), 0, 512, recorder.callback())
        .unwrap();
    let outcome = DeleteOutcome::default();
    let mut task = backend.delete_device(&device, outcome.callback()).unwrap();
    assert!((&mut task).now_or_never().is_none());

    drop(channel);
    assert_eq!(
        recorder.take()[0].error_kind(),
        Some(BdevErrorKind::Cancelled)
    );
    block_on(task);
    assert!(outcome.succeeded());
    assert!(image.is_closed());
}

#[test]
fn remote_failures_keep_raw_status() {
    let (backend, image) = setup(MIB, BackendConfig::default());
    let device = create(&backend, 512);
    let mut channel = IoChannel::open(&device).unwrap();
    let recorder = Recorder::default();

    image.inject_status(-5);
    device
        .write(
            &mut channel,
            SgList::from(vec![3u8; 512]),
            0,
            512,
            recorder.callback(),
        )
        .unwrap();
    image.inject_status(100);
    device
        .read(&mut channel, SgList::zeroed(512), 0, 512, recorder.callback())
        .unwrap();
    image.inject_status(512);
    device
        .write(
            &mut channel,
            SgList::from(vec![3u8; 512]),
            0,
            512,
            recorder.callback(),
        )
        .unwrap();
    assert_eq!(channel.poll(), 3);

    let done = recorder.take();
    let statuses: Vec<Option<i32>> = done
        .iter()
        .map(|c| c.result.as_ref().unwrap_err().remote_status())
        .collect();
    assert_eq!(statuses, vec![Some(-5), Some(100), Some(512)]);
    assert!(done
        .iter()
        .all(|c| c.error_kind() == Some(BdevErrorKind::RemoteIo)));
    assert_eq!(image.snapshot(0, 512), vec![0u8; 512]);
}

#[test]
fn mismatched_buffers_are_invalid() {
    let (backend, _image) = setup(MIB, BackendConfig::default());
    let device = create(&backend, 512);
    let mut channel = IoChannel::open(&device).unwrap();
    let recorder = Recorder::default();

    let err = device
        .read(&mut channel, SgList::zeroed(256), 0, 512, recorder.callback())
        .unwrap_err();
    assert_eq!(err.kind(), BdevErrorKind::InvalidArgument);

    let err = channel
        .submit(
            vbd_core::IoKind::Flush,
            SgList::zeroed(512),
            0,
            0,
            recorder.callback(),
        )
        .unwrap_err();
    assert_eq!(err.kind(), BdevErrorKind::InvalidArgument);
    assert_eq!(channel.inflight_len(), 0);
}

#[test]
fn scattered_write_lands_contiguously() {
    let (backend, image) = setup(MIB, BackendConfig::default());
    let device = create(&backend, 512);
    let mut channel = IoChannel::open(&device).unwrap();
    let recorder = Recorder::default();

    let buffers = SgList::from_segments(vec![vec![1u8; 256], vec![2u8; 768]]);
    device
        .write(&mut channel, buffers, 4096, 1024, recorder.callback())
        .unwrap();
    channel.poll();
    assert!(recorder.take()[0].is_success());
    let data = image.snapshot(4096, 1024);
    assert_eq!(&data[..256], &[1u8; 256][..]);
    assert_eq!(&data[256..], &[2u8; 768][..]);

    device
        .unmap(&mut channel, 4096, 512, recorder.callback())
        .unwrap();
    channel.poll();
    assert_eq!(image.snapshot(4096, 512), vec![0u8; 512]);
}

#[test]
fn channel_is_bound_to_its_device() {
    let client = MemoryVolumeClient::new();
    client.create_image("rbd", "a", MIB).unwrap();
    client.create_image("rbd", "b", MIB).unwrap();
    let backend = Backend::new(Arc::new(client), BackendConfig::default()).unwrap();
    let a = block_on(backend.create_device("a", "rbd", "a", 512)).unwrap();
    let b = block_on(backend.create_device("b", "rbd", "b", 512)).unwrap();

    let mut channel = IoChannel::open(&a).unwrap();
    let err = b
        .flush(&mut channel, 0, 0, Recorder::default().callback())
        .unwrap_err();
    assert_eq!(err.kind(), BdevErrorKind::InvalidArgument);

    let names: Vec<String> = backend
        .devices()
        .iter()
        .map(|d| d.name().to_owned())
        .collect();
    assert_eq!(names, vec!["a", "b"]);
}

#[test]
fn create_validates_configuration() {
    let client = MemoryVolumeClient::new();
    client.create_image("rbd", "disk0", MIB).unwrap();
    let tiny = client.create_image("rbd", "tiny", 1024).unwrap();
    let locked = client.create_image("rbd", "locked", MIB).unwrap();
    locked.deny_open(true);
    let backend = Backend::new(Arc::new(client), BackendConfig::default()).unwrap();

    for block_size in [0, 1000, 3] {
        let err = block_on(backend.create_device("x", "rbd", "disk0", block_size)).unwrap_err();
        assert_eq!(err.kind(), BdevErrorKind::InvalidConfig, "{block_size}");
    }

    let err = block_on(backend.create_device("x", "rbd", "tiny", 4096)).unwrap_err();
    assert_eq!(err.kind(), BdevErrorKind::InvalidConfig);
    assert_eq!(tiny.close_count(), 1);

    let err = block_on(backend.create_device("x", "rbd", "missing", 512)).unwrap_err();
    assert_eq!(err.kind(), BdevErrorKind::VolumeOpenFailed);
    let err = block_on(backend.create_device("x", "rbd", "locked", 512)).unwrap_err();
    assert_eq!(err.kind(), BdevErrorKind::VolumeOpenFailed);
    let err = block_on(backend.create_device("", "rbd", "disk0", 512)).unwrap_err();
    assert_eq!(err.kind(), BdevErrorKind::InvalidConfig);

    assert!(backend.devices().is_empty());
    block_on(backend.create_device("x", "rbd", "disk0", 512)).unwrap();
    let err = block_on(backend.create_device("x", "rbd", "disk0", 512)).unwrap_err();
    assert_eq!(err.kind(), BdevErrorKind::InvalidConfig);
    assert_eq!(backend.devices().len(), 1);
}

#[test]
fn zero_capacity_backend_is_rejected() {
    let client = MemoryVolumeClient::new();
    let err = Backend::new(
        Arc::new(client),
        BackendConfig {
            channel_capacity: 0,
        },
    )
    .err()
    .unwrap();
    assert_eq!(err.kind(), BdevErrorKind::InvalidConfig);
}

#[test]
fn channels_on_many_threads_drain_before_delete() {
    const THREADS: usize = 4;
    let (backend, image) = setup(MIB, BackendConfig::default());
    let device = create(&backend, 512);
    let ready = Arc::new(Barrier::new(THREADS + 1));
    let deleting = Arc::new(Barrier::new(THREADS + 1));

    let handles: Vec<_> = (0..THREADS)
        .map(|idx| {
            let device = device.clone();
            let ready = ready.clone();
            let deleting = deleting.clone();
            thread::spawn(move || {
                let mut channel = IoChannel::open(&device).unwrap();
                let recorder = Recorder::default();
                let offset = idx as u64 * 512;
                device
                    .write(
                        &mut channel,
                        SgList::from(vec![idx as u8 + 1; 512]),
                        offset,
                        512,
                        recorder.callback(),
                    )
                    .unwrap();
                while recorder.len() < 1 {
                    channel.poll();
                }
                device
                    .read(
                        &mut channel,
                        SgList::zeroed(512),
                        offset,
                        512,
                        recorder.callback(),
                    )
                    .unwrap();
                ready.wait();
                deleting.wait();
                while recorder.len() < 2 {
                    channel.poll();
                }
                let done = recorder.take();
                assert!(done.iter().all(IoCompletion::is_success));
                assert_eq!(
                    done[1].buffers.as_ref().unwrap().to_vec(),
                    vec![idx as u8 + 1; 512]
                );
                channel.poll();
            })
        })
        .collect();

    ready.wait();
    let outcome = DeleteOutcome::default();
    let task = backend.delete_device(&device, outcome.callback()).unwrap();
    deleting.wait();
    block_on(task);
    for handle in handles {
        handle.join().unwrap();
    }
    assert!(outcome.succeeded());
    assert_eq!(image.close_count(), 1);
    assert_eq!(device.state(), DeviceState::Deleted);
}
