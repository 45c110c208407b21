use std::{
    io::{Read, Write},
    net::{SocketAddr, TcpListener},
    thread,
    time::Duration,
};

use knnwire::{
    Client, ClientError, Command, Matrix, Metric, QueryVectors, Session, SessionPool, Status,
    protocol::{ApplianceHandle, MockAppliance, Response, SessionState, codec::REQUEST_HEADER_SIZE},
};

const KEY: &str = "test-key";

fn localhost() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn spawn(appliance: MockAppliance) -> ApplianceHandle {
    appliance.spawn(localhost()).unwrap()
}

fn connect(handle: &ApplianceHandle, key: &str) -> Client {
    Client::connect("127.0.0.1", handle.addr().port(), key).unwrap()
}

fn fixture() -> Matrix<f32> {
    Matrix::from_rows(&[[0.0, 0.0], [1.0, 0.0], [5.0, 5.0]]).unwrap()
}

/// Points `[i, 0]` for `i` in `0..n`.
fn line(n: usize) -> Matrix<f32> {
    let rows: Vec<[f32; 2]> = (0..n).map(|i| [i as f32, 0.0]).collect();
    Matrix::from_rows(&rows).unwrap()
}

/// `rows` queries cycling through the points of [`line`], so query `r` is exactly
/// dataset point `r % n`.
fn cycling_queries(rows: usize, n: usize) -> Matrix<f32> {
    let data: Vec<[f32; 2]> = (0..rows).map(|r| [(r % n) as f32, 0.0]).collect();
    Matrix::from_rows(&data).unwrap()
}

#[test]
fn l2_fixture_query() {
    let handle = spawn(MockAppliance::new(fixture(), Metric::L2).with_api_key(KEY));
    let mut client = connect(&handle, KEY);

    let result = client
        .query(&QueryVectors::Single(vec![0.0, 0.0]), 2, 128)
        .unwrap();

    assert_eq!(result.indices.as_slice(), &[0, 1]);
    assert_eq!(result.distances.as_slice(), &[0.0, 1.0]);
    assert_eq!(handle.batch_sizes(), vec![1]);
    assert!(result.timings.client_elapsed >= result.timings.server_elapsed);
}

#[test]
fn large_query_is_split_and_kept_in_order() {
    let handle = spawn(MockAppliance::new(line(50), Metric::L2).with_api_key(KEY));
    let mut client = connect(&handle, KEY);

    let queries = QueryVectors::Batch(cycling_queries(2500, 50));
    let result = client.query(&queries, 2, 1024).unwrap();

    assert_eq!(handle.batch_sizes(), vec![1024, 1024, 452]);
    assert_eq!(result.indices.shape(), (2500, 2));
    for (r, row) in result.indices.iter_rows().enumerate() {
        assert_eq!(row[0], (r % 50) as i32, "row {r}");
    }
    assert!(client.session().is_open());
}

#[test]
fn non_f32_input_is_coerced() {
    let handle = spawn(MockAppliance::new(fixture(), Metric::L2));
    let mut client = connect(&handle, "");

    let queries = QueryVectors::from_shape(&[2, 2], &[5i64, 5, 1, 0]).unwrap();
    let result = client.query(&queries, 1, 1).unwrap();

    assert_eq!(result.indices.as_slice(), &[2, 1]);
    assert_eq!(handle.batch_sizes(), vec![1, 1]);
}

#[test]
fn invalid_api_key_closes_the_session() {
    let handle = spawn(MockAppliance::new(fixture(), Metric::L2).with_api_key(KEY));
    let mut client = connect(&handle, "wrong");

    let res = client.query(&QueryVectors::Single(vec![0.0, 0.0]), 2, 128);
    assert!(matches!(
        res,
        Err(ClientError::Remote {
            status: Status::InvalidApiKey
        })
    ));
    assert_eq!(client.session().state(), SessionState::Failed);

    let again = client.query(&QueryVectors::Single(vec![0.0, 0.0]), 2, 128);
    assert!(matches!(again, Err(ClientError::Connection { .. })));
    assert!(handle.batch_sizes().is_empty());
}

#[test]
fn forced_status_is_surfaced() {
    let handle = spawn(MockAppliance::new(fixture(), Metric::L2).with_status(Status::Timeout));
    let mut client = connect(&handle, "");

    let res = client.load_dataset_file("/data/set.h5", "lsi", Metric::L2);
    assert!(matches!(
        res,
        Err(ClientError::Remote {
            status: Status::Timeout
        })
    ));
}

#[test]
fn zero_rows_never_reach_the_appliance() {
    let handle = spawn(MockAppliance::new(fixture(), Metric::L2));
    let mut client = connect(&handle, "");

    let res = client.query(&QueryVectors::Batch(Matrix::empty(2)), 2, 16);
    assert!(matches!(res, Err(ClientError::InvalidArgument(_))));
    assert!(handle.batch_sizes().is_empty());

    // The session is untouched and still usable.
    client
        .query(&QueryVectors::Single(vec![1.0, 0.0]), 1, 16)
        .unwrap();
}

#[test]
fn load_and_query_from_file() {
    let handle = spawn(MockAppliance::new(fixture(), Metric::L2).with_api_key(KEY));
    let mut client = connect(&handle, KEY);

    client
        .load_dataset_file("/data/set.h5", "vectors", Metric::L2)
        .unwrap();
    let loads = handle.loads();
    assert_eq!(loads.len(), 1);
    assert_eq!(loads[0].file_name, "/data/set.h5");
    assert_eq!(loads[0].dataset_name, "vectors");

    let result = client.query_from_file("/data/set.h5", "vectors", 2, 1024).unwrap();
    assert_eq!(result.indices.shape(), (3, 2));
    // Every point is its own nearest neighbour.
    for (r, row) in result.indices.iter_rows().enumerate() {
        assert_eq!(row[0], r as i32);
    }
}

#[test]
fn session_pool_preserves_row_order() {
    let handle = spawn(MockAppliance::new(line(50), Metric::L2));
    let pool = SessionPool::connect("127.0.0.1", handle.addr().port(), "", 3).unwrap();

    let result = pool.query(&cycling_queries(2500, 50), 1, 100).unwrap();

    assert_eq!(result.indices.shape(), (2500, 1));
    for (r, row) in result.indices.iter_rows().enumerate() {
        assert_eq!(row[0], (r % 50) as i32, "row {r}");
    }
    let mut sizes = handle.batch_sizes();
    sizes.sort();
    assert_eq!(sizes, vec![100; 25]);
}

#[test]
fn session_pool_rejects_zero_rows() {
    let handle = spawn(MockAppliance::new(fixture(), Metric::L2));
    let pool = SessionPool::connect("127.0.0.1", handle.addr().port(), "", 2).unwrap();

    let res = pool.query(&Matrix::empty(2), 1, 10);
    assert!(matches!(res, Err(ClientError::InvalidArgument(_))));
}

#[test]
fn connect_to_closed_port_fails() {
    let port = {
        let listener = TcpListener::bind(localhost()).unwrap();
        listener.local_addr().unwrap().port()
    };

    let res = Session::open("127.0.0.1", port, KEY);
    assert!(matches!(res, Err(ClientError::Connection { .. })));
}

#[test]
fn cancel_unblocks_a_pending_round_trip() {
    let listener = TcpListener::bind(localhost()).unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut buf = [0u8; REQUEST_HEADER_SIZE];
        stream.read_exact(&mut buf).unwrap();
        // Never answer; hold the connection until the client goes away.
        let mut rest = Vec::new();
        let _ = stream.read_to_end(&mut rest);
    });

    let mut session = Session::open("127.0.0.1", port, KEY).unwrap();
    let cancel = session.cancel_handle().unwrap();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        cancel.cancel().unwrap();
    });

    let req = session.request(Command::LoadDatasetFile, 0);
    let res = session.round_trip(&req);

    assert!(matches!(res, Err(ClientError::ConnectionClosed)));
    assert_eq!(session.state(), SessionState::Failed);
    canceller.join().unwrap();
    drop(session);
    server.join().unwrap();
}

#[test]
fn corrupted_response_fails_with_checksum_mismatch() {
    let listener = TcpListener::bind(localhost()).unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut buf = [0u8; REQUEST_HEADER_SIZE];
        stream.read_exact(&mut buf).unwrap();

        let mut resp = Response::new(Command::LoadDatasetFile, Status::Success).pack().unwrap();
        resp[4] ^= 0x80;
        stream.write_all(&resp).unwrap();
    });

    let mut session = Session::open("127.0.0.1", port, KEY).unwrap();
    let req = session.request(Command::LoadDatasetFile, 0);

    assert!(matches!(
        session.round_trip(&req),
        Err(ClientError::ChecksumMismatch { .. })
    ));
    assert_eq!(session.state(), SessionState::Failed);
    server.join().unwrap();
}

#[test]
fn write_to_closed_peer_is_transmission_error() {
    let listener = TcpListener::bind(localhost()).unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        drop(stream);
    });

    let mut session = Session::open("127.0.0.1", port, KEY).unwrap();
    server.join().unwrap();

    // Far more than the socket buffers hold, so the write hits the reset.
    let mut req = session.request(Command::Query, 1);
    req.pack_vectors(&vec![0.0; 1 << 20]);

    assert!(matches!(
        session.round_trip(&req),
        Err(ClientError::Transmission(_))
    ));
    assert_eq!(session.state(), SessionState::Failed);
}

#[test]
fn session_pool_surfaces_remote_error() {
    let handle = spawn(MockAppliance::new(fixture(), Metric::L2).with_api_key("right"));
    let pool = SessionPool::connect("127.0.0.1", handle.addr().port(), "wrong", 2).unwrap();
    let queries = cycling_queries(10, 3);

    let res = pool.query(&queries, 1, 2);
    assert!(matches!(
        res,
        Err(ClientError::Remote {
            status: Status::InvalidApiKey
        })
    ));
    assert!(!pool.is_healthy());

    // Whichever worker picks up a job, the query fails and returns.
    let again = pool.query(&queries, 1, 2);
    assert!(matches!(
        again,
        Err(ClientError::Connection { .. })
            | Err(ClientError::Remote {
                status: Status::InvalidApiKey
            })
    ));
    assert!(handle.batch_sizes().is_empty());
}

#[test]
fn failed_session_rejects_later_pool_queries() {
    let handle = spawn(MockAppliance::new(fixture(), Metric::L2).with_api_key("right"));
    let pool = SessionPool::connect("127.0.0.1", handle.addr().port(), "wrong", 1).unwrap();
    let queries = cycling_queries(10, 3);

    assert!(matches!(
        pool.query(&queries, 1, 2),
        Err(ClientError::Remote { .. })
    ));
    assert!(matches!(
        pool.query(&queries, 1, 2),
        Err(ClientError::Connection { .. })
    ));
}

#[test]
fn healthy_pool_stays_healthy() {
    let handle = spawn(MockAppliance::new(fixture(), Metric::L2));
    let pool = SessionPool::connect("127.0.0.1", handle.addr().port(), "", 2).unwrap();

    pool.query(&cycling_queries(10, 3), 1, 3).unwrap();
    assert!(pool.is_healthy());
}

#[test]
fn cancelled_pool_fails_its_next_query() {
    let handle = spawn(MockAppliance::new(fixture(), Metric::L2));
    let pool = SessionPool::connect("127.0.0.1", handle.addr().port(), "", 2).unwrap();

    let handles = pool.cancel_handles().unwrap();
    assert_eq!(handles.len(), 2);
    for cancel in &handles {
        cancel.cancel().unwrap();
    }

    assert!(pool.query(&cycling_queries(10, 3), 1, 2).is_err());
    assert!(!pool.is_healthy());
}
