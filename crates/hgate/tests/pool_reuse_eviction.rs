// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connection pool behaviour: reuse across sessions, admission control,
//! expiry sweeps.

use hgate::pool::{BackendConn, ConnIdentity, PoolGroup, ReuseQuality, ServerEndpoint};
use hgate::server::{Server, ServerAddress, ServerId};
use std::sync::Arc;
use std::time::Duration;

fn identity(user: &str, db: &str) -> ConnIdentity {
    ConnIdentity {
        user: user.into(),
        default_db: db.into(),
    }
}

fn server_with_pooling(id: u32) -> Arc<Server> {
    let server = Server::new(
        ServerId(id),
        format!("db{id}"),
        ServerAddress::parse("127.0.0.1", 3306),
    );
    server.set_persist_pool_max(1);
    server.set_max_routing_connections(1);
    server
}

#[test]
fn sequential_sessions_reuse_one_connection() {
    // Two sessions sequentially target the same server with
    // max_routing_connections=1 and persistpoolmax=1. Session B must
    // reuse A's connection: no new backend socket, times_found +1.
    let pools = Arc::new(PoolGroup::new());
    let server = server_with_pooling(1);
    pools.register_server(Arc::clone(&server));

    // Session A acquires, uses and releases its connection.
    let result = pools.get_backend_connection(&server, &identity("app", "shop"));
    let (_, mut conn) = result.conn.expect("first connection");
    let conn_id = conn.id();
    conn.set_polling(true);
    conn.set_established();
    assert_eq!(server.stats().n_total_conns(), 1);
    pools
        .try_pool_connection(conn, true, 1)
        .expect("connection enters the pool");

    let before = pools.stats(ServerId(1)).unwrap();
    assert_eq!(before.curr_size, 1);

    // Session B asks for a connection to the same server.
    let result = pools.get_backend_connection(&server, &identity("app", "shop"));
    let (quality, conn) = result.conn.expect("pooled connection");
    assert_eq!(conn.id(), conn_id, "same underlying connection");
    assert_eq!(quality, ReuseQuality::Optimal);

    let after = pools.stats(ServerId(1)).unwrap();
    assert_eq!(after.times_found, before.times_found + 1);
    assert_eq!(
        server.stats().n_total_conns(),
        1,
        "no new backend socket was created"
    );
}

#[test]
fn partial_reuse_rewinds_history_position() {
    let pools = Arc::new(PoolGroup::new());
    let server = server_with_pooling(1);
    pools.register_server(Arc::clone(&server));

    let result = pools.get_backend_connection(&server, &identity("app", "shop"));
    let (_, mut conn) = result.conn.unwrap();
    conn.set_polling(true);
    conn.set_established();
    conn.set_history_pos(4);
    pools.try_pool_connection(conn, true, 1).unwrap();

    // A session with another default schema gets the connection as a
    // partial reuse; the replay position starts over.
    let result = pools.get_backend_connection(&server, &identity("app", "crm"));
    let (quality, conn) = result.conn.unwrap();
    assert_eq!(quality, ReuseQuality::Partial);
    assert_eq!(conn.history_pos(), 0);
    assert_eq!(conn.identity().default_db, "crm");
}

#[test]
fn admission_queue_wakes_fifo_and_times_out() {
    let pools = Arc::new(PoolGroup::new());
    let server = server_with_pooling(1);
    pools.register_server(Arc::clone(&server));

    let mut holder = ServerEndpoint::new(
        1,
        Arc::clone(&server),
        Arc::clone(&pools),
        identity("app", "shop"),
        Duration::from_secs(60),
    );
    assert!(matches!(
        holder.connect(),
        hgate::pool::ConnectOutcome::Connected(_)
    ));

    // Two more sessions hit the cap and queue in order.
    let mut second = ServerEndpoint::new(
        2,
        Arc::clone(&server),
        Arc::clone(&pools),
        identity("app", "shop"),
        Duration::from_secs(60),
    );
    let mut third = ServerEndpoint::new(
        3,
        Arc::clone(&server),
        Arc::clone(&pools),
        identity("app", "shop"),
        Duration::from_millis(1),
    );
    assert_eq!(second.connect(), hgate::pool::ConnectOutcome::Queued);
    assert_eq!(third.connect(), hgate::pool::ConnectOutcome::Queued);

    // Nothing wakes while the slot is taken.
    assert_eq!(pools.activate_waiting(), Vec::<u64>::new());

    // The third session's multiplex timeout expires.
    std::thread::sleep(Duration::from_millis(5));
    assert_eq!(pools.fail_timed_out_waiters(), vec![3]);

    // Releasing the held connection wakes the remaining waiter, FIFO.
    holder.close();
    assert_eq!(pools.activate_waiting(), vec![2]);
    assert!(matches!(
        second.connect(),
        hgate::pool::ConnectOutcome::Connected(_)
    ));
}

#[test]
fn expiry_sweep_reaps_hangups_and_old_connections() {
    let pools = Arc::new(PoolGroup::new());
    let server = Server::new(
        ServerId(1),
        "db1",
        ServerAddress::parse("127.0.0.1", 3306),
    );
    server.set_persist_pool_max(8);
    pools.register_server(Arc::clone(&server));

    for hang in [false, true, false] {
        let mut conn = BackendConn::new(
            Arc::clone(&server),
            identity("app", "shop"),
            None,
        );
        conn.set_polling(true);
        conn.set_established();
        server.stats().add_connection();
        if hang {
            conn.set_hanged_up();
        }
        pools.try_pool_connection(conn, true, 1).unwrap();
    }

    // Only the hung-up entry goes; no age limit is set.
    let evicted = pools.close_expired();
    assert_eq!(evicted.len(), 1);
    assert!(evicted[0].hanged_up());
    assert_eq!(pools.stats(ServerId(1)).unwrap().curr_size, 2);

    // With a tiny max age everything goes on the next sweep.
    server.set_persist_max_time(Duration::from_millis(1));
    std::thread::sleep(Duration::from_millis(5));
    let evicted = pools.close_expired();
    assert_eq!(evicted.len(), 2);
    assert_eq!(pools.stats(ServerId(1)).unwrap().curr_size, 0);
}

#[test]
fn server_down_closes_pool() {
    let pools = Arc::new(PoolGroup::new());
    let server = server_with_pooling(1);
    pools.register_server(Arc::clone(&server));

    let result = pools.get_backend_connection(&server, &identity("app", "shop"));
    let (_, mut conn) = result.conn.unwrap();
    conn.set_polling(true);
    conn.set_established();
    pools.try_pool_connection(conn, true, 1).unwrap();

    let closed = pools.close_all(Some(ServerId(1)));
    assert_eq!(closed.len(), 1);
    assert!(pools.stats(ServerId(1)).is_none(), "pool entry removed");
}

#[test]
fn capacity_is_global_share_per_worker() {
    let pools = Arc::new(PoolGroup::new());
    let server = Server::new(
        ServerId(1),
        "db1",
        ServerAddress::parse("127.0.0.1", 3306),
    );
    server.set_persist_pool_max(4);
    pools.register_server(Arc::clone(&server));

    // With four workers sharing a global cap of 4, this worker keeps one.
    let n_workers = 4;
    for index in 0..3 {
        let mut conn = BackendConn::new(
            Arc::clone(&server),
            identity("app", "shop"),
            None,
        );
        conn.set_polling(true);
        conn.set_established();
        let pooled = pools.try_pool_connection(conn, true, n_workers);
        if index == 0 {
            assert!(pooled.is_ok());
        } else {
            assert!(pooled.is_err(), "per-worker share is exhausted");
        }
    }
}
