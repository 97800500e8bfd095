//! Directory and call registry.
//!
//! Server-side state machine owning users, calls, and the multicast address
//! pool. Operations mutate state and return [`Directive`]s describing what to
//! send to whom; the event loop is the sole caller, so no locking is needed
//! here, and the actual sending goes through the task queue.
//!
//! Malformed or out-of-order requests (unknown connection, unknown user,
//! response without a matching request) are ignored and return no directives.

use std::collections::HashMap;
use std::net::SocketAddr;

use tracing::{debug, info, warn};

use crate::domain::message::{
    CallMsg, CallResponse, CallUpdateMsg, JoinMsg, JoinStatus, Message, UserUpdateMsg,
};
use crate::domain::roster::{CallInfo, UserInfo, UserStatus, KEY_EXCHANGE_PORT};

use super::addr_pool::MulticastAddrPool;

// ---------------------------------------------------------------------------
// Connection context
// ---------------------------------------------------------------------------

/// Server-assigned connection identifier.
pub type ConnId = u64;

/// Everything the registry may know about the connection behind an operation.
#[derive(Debug, Clone, Copy)]
pub struct ConnCtx {
    pub id: ConnId,
    /// Remote address of the control connection; the IP doubles as the host
    /// for the key-exchange listener when this user masters a call.
    pub addr: SocketAddr,
}

// ---------------------------------------------------------------------------
// Directives
// ---------------------------------------------------------------------------

/// Who should receive a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipients {
    One(ConnId),
    AllExcept(ConnId),
    All,
}

/// One message the caller must enqueue for delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct Directive {
    pub to: Recipients,
    pub msg: Message,
}

fn to_one(conn: ConnId, msg: Message) -> Directive {
    Directive {
        to: Recipients::One(conn),
        msg,
    }
}

fn to_all(msg: Message) -> Directive {
    Directive {
        to: Recipients::All,
        msg,
    }
}

fn to_all_except(conn: ConnId, msg: Message) -> Directive {
    Directive {
        to: Recipients::AllExcept(conn),
        msg,
    }
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct UserEntry {
    conn: ConnId,
    addr: SocketAddr,
    status: UserStatus,
    /// Key into `calls` (the call's current master) if the user is in one.
    call: Option<String>,
}

#[derive(Debug, Default)]
pub struct Registry {
    users: HashMap<String, UserEntry>,
    names: HashMap<ConnId, String>,
    /// Calls keyed by their current master's name.
    calls: HashMap<String, CallInfo>,
    pool: MulticastAddrPool,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a recipients selector against the current user set.
    pub fn resolve(&self, to: Recipients) -> Vec<ConnId> {
        match to {
            Recipients::One(conn) => vec![conn],
            Recipients::All => self.users.values().map(|u| u.conn).collect(),
            Recipients::AllExcept(conn) => self
                .users
                .values()
                .map(|u| u.conn)
                .filter(|&c| c != conn)
                .collect(),
        }
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn call_count(&self) -> usize {
        self.calls.len()
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Route one decoded control message from a connection.
    pub fn handle_message(&mut self, ctx: ConnCtx, msg: Message) -> Vec<Directive> {
        match msg {
            Message::Join(JoinMsg::Request { name }) => self.join(ctx, name),
            Message::Call(CallMsg::Request { callee }) => self.call_request(ctx, &callee),
            Message::Call(CallMsg::CalleeResponse { caller, status }) => {
                self.callee_response(ctx, &caller, status)
            }
            Message::Session(crate::domain::message::SessionMsg::Leave) => self.leave(ctx),
            other => {
                debug!(conn = ctx.id, ?other, "ignoring message the registry does not handle");
                Vec::new()
            }
        }
    }

    // -----------------------------------------------------------------------
    // join
    // -----------------------------------------------------------------------

    /// Register a user, replying with the directory snapshot as of this
    /// instant (not including the joiner) and notifying everyone else.
    ///
    /// A connection carries at most one identity: a repeat join from an
    /// already-registered connection is rejected, otherwise the old name
    /// would outlive its `names` mapping and survive disconnect forever.
    pub fn join(&mut self, ctx: ConnCtx, name: String) -> Vec<Directive> {
        if self.users.contains_key(&name) || self.names.contains_key(&ctx.id) {
            info!(%name, conn = ctx.id, "join rejected: name taken or connection already registered");
            return vec![to_one(
                ctx.id,
                Message::Join(JoinMsg::Response {
                    status: JoinStatus::No,
                    name,
                    user_info_lst: Vec::new(),
                    call_info_lst: Vec::new(),
                }),
            )];
        }

        let user_info_lst: Vec<UserInfo> = self
            .users
            .iter()
            .map(|(n, u)| UserInfo {
                name: n.clone(),
                status: u.status,
            })
            .collect();
        let call_info_lst: Vec<CallInfo> = self.calls.values().cloned().collect();

        self.users.insert(
            name.clone(),
            UserEntry {
                conn: ctx.id,
                addr: ctx.addr,
                status: UserStatus::Available,
                call: None,
            },
        );
        self.names.insert(ctx.id, name.clone());
        info!(%name, conn = ctx.id, "user joined directory");

        vec![
            to_one(
                ctx.id,
                Message::Join(JoinMsg::Response {
                    status: JoinStatus::Ok,
                    name: name.clone(),
                    user_info_lst,
                    call_info_lst,
                }),
            ),
            to_all_except(ctx.id, Message::UserUpdate(UserUpdateMsg::Join { name })),
        ]
    }

    // -----------------------------------------------------------------------
    // call formation
    // -----------------------------------------------------------------------

    /// A caller asks for a callee. Both go `in_call` and the callee is asked
    /// to participate; no call object exists yet.
    pub fn call_request(&mut self, ctx: ConnCtx, callee: &str) -> Vec<Directive> {
        let Some(caller) = self.names.get(&ctx.id).cloned() else {
            return Vec::new();
        };

        let reject = |conn| {
            vec![to_one(
                conn,
                Message::Call(CallMsg::CalleeResponse {
                    caller: caller.clone(),
                    status: CallResponse::Reject,
                }),
            )]
        };

        if callee == caller {
            return reject(ctx.id);
        }
        let callee_conn = match self.users.get(callee) {
            Some(u) if u.status == UserStatus::Available => u.conn,
            // Busy or unknown callee: immediate rejection back to the caller.
            _ => {
                info!(%caller, %callee, "call request rejected: callee unavailable");
                return reject(ctx.id);
            }
        };

        let mut out = Vec::new();
        for name in [&caller, &String::from(callee)] {
            if let Some(user) = self.users.get_mut(name.as_str()) {
                user.status = UserStatus::InCall;
            }
            out.push(to_all(Message::UserUpdate(UserUpdateMsg::Status {
                name: name.clone(),
                status: UserStatus::InCall,
            })));
        }
        out.push(to_one(
            callee_conn,
            Message::Call(CallMsg::Participate { caller }),
        ));
        out
    }

    /// The callee's answer. Accept creates a call (or joins the existing call
    /// of either party); reject reverts both to available.
    pub fn callee_response(
        &mut self,
        ctx: ConnCtx,
        caller: &str,
        status: CallResponse,
    ) -> Vec<Directive> {
        let Some(callee) = self.names.get(&ctx.id).cloned() else {
            return Vec::new();
        };
        let Some(caller_conn) = self.users.get(caller).map(|u| u.conn) else {
            // Caller vanished mid-handshake; free the callee again.
            return self.set_status(&callee, UserStatus::Available);
        };

        match status {
            CallResponse::Reject => {
                info!(%caller, %callee, "call rejected by callee");
                let mut out = self.set_status(caller, UserStatus::Available);
                out.extend(self.set_status(&callee, UserStatus::Available));
                out.push(to_one(
                    caller_conn,
                    Message::Call(CallMsg::CalleeResponse {
                        caller: caller.to_owned(),
                        status: CallResponse::Reject,
                    }),
                ));
                out
            }
            CallResponse::Accept => {
                // If either side already has a call, the other joins it.
                let existing = self
                    .users
                    .get(caller)
                    .and_then(|u| u.call.clone())
                    .map(|key| (key, callee.clone()))
                    .or_else(|| {
                        self.users
                            .get(&callee)
                            .and_then(|u| u.call.clone())
                            .map(|key| (key, caller.to_owned()))
                    });

                match existing {
                    Some((call_key, joiner)) => self.join_call(&call_key, &joiner),
                    None => self.create_call(caller, &callee),
                }
            }
        }
    }

    fn create_call(&mut self, master: &str, second: &str) -> Vec<Directive> {
        let Some((master_conn, master_addr)) = self.users.get(master).map(|u| (u.conn, u.addr))
        else {
            return Vec::new();
        };
        let Some(addrs) = self.pool.allocate() else {
            // No free multicast groups; abort the call and free both users.
            warn!(%master, "multicast address space exhausted, rejecting call");
            let mut out = self.set_status(master, UserStatus::Available);
            out.extend(self.set_status(second, UserStatus::Available));
            out.push(to_one(
                master_conn,
                Message::Call(CallMsg::CalleeResponse {
                    caller: master.to_owned(),
                    status: CallResponse::Reject,
                }),
            ));
            return out;
        };
        let info = CallInfo {
            master: master.to_owned(),
            user_lst: vec![master.to_owned(), second.to_owned()],
            addrs,
            key_addr: SocketAddr::new(master_addr.ip(), KEY_EXCHANGE_PORT),
        };
        for name in [master, second] {
            if let Some(user) = self.users.get_mut(name) {
                user.call = Some(master.to_owned());
            }
        }
        self.calls.insert(master.to_owned(), info.clone());
        info!(%master, participants = 2, "call created");

        vec![to_all(Message::CallUpdate(CallUpdateMsg::CallAdd {
            master: master.to_owned(),
            info,
        }))]
    }

    fn join_call(&mut self, call_key: &str, joiner: &str) -> Vec<Directive> {
        let Some(info) = self.calls.get_mut(call_key) else {
            return Vec::new();
        };
        info.user_lst.push(joiner.to_owned());
        let info = info.clone();
        if let Some(user) = self.users.get_mut(joiner) {
            user.call = Some(call_key.to_owned());
        }
        info!(master = %call_key, %joiner, "user joined call");

        vec![to_all(Message::CallUpdate(CallUpdateMsg::UserJoin {
            master: call_key.to_owned(),
            name: joiner.to_owned(),
            info,
        }))]
    }

    // -----------------------------------------------------------------------
    // leaving
    // -----------------------------------------------------------------------

    /// A user leaves their call (but stays in the directory).
    pub fn leave(&mut self, ctx: ConnCtx) -> Vec<Directive> {
        let Some(name) = self.names.get(&ctx.id).cloned() else {
            return Vec::new();
        };
        self.leave_call(&name)
    }

    /// Full disconnect: call teardown first, then directory removal.
    pub fn disconnect(&mut self, conn: ConnId) -> Vec<Directive> {
        let Some(name) = self.names.remove(&conn) else {
            return Vec::new();
        };
        let mut out = self.leave_call(&name);
        self.users.remove(&name);
        info!(%name, "user left directory");
        out.push(to_all(Message::UserUpdate(UserUpdateMsg::Leave { name })));
        out
    }

    fn leave_call(&mut self, name: &str) -> Vec<Directive> {
        let Some(call_key) = self.users.get(name).and_then(|u| u.call.clone()) else {
            return Vec::new();
        };
        let Some(mut info) = self.calls.remove(&call_key) else {
            return Vec::new();
        };

        info.user_lst.retain(|n| n != name);
        if let Some(user) = self.users.get_mut(name) {
            user.call = None;
        }
        let mut out = self.set_status(name, UserStatus::Available);

        if info.user_lst.len() <= 1 {
            // The call dissolves; its addresses return to the pool.
            self.pool.release(info.addrs);
            if let Some(last) = info.user_lst.first().cloned() {
                if let Some(user) = self.users.get_mut(&last) {
                    user.call = None;
                }
                out.extend(self.set_status(&last, UserStatus::Available));
            }
            info!(master = %call_key, "call dissolved");
            out.push(to_all(Message::CallUpdate(CallUpdateMsg::CallRemove {
                master: call_key,
            })));
            return out;
        }

        // The earliest-joined remaining participant becomes master.
        if info.master == name {
            let new_master = info.user_lst[0].clone();
            info.master = new_master.clone();
            if let Some(entry) = self.users.get(&new_master) {
                info.key_addr = SocketAddr::new(entry.addr.ip(), KEY_EXCHANGE_PORT);
            }
            for participant in &info.user_lst {
                if let Some(user) = self.users.get_mut(participant) {
                    user.call = Some(new_master.clone());
                }
            }
            info!(old = %name, new = %new_master, "master migrated");
        }
        let master = info.master.clone();
        self.calls.insert(master.clone(), info.clone());

        out.push(to_all(Message::CallUpdate(CallUpdateMsg::UserLeave {
            master,
            name: name.to_owned(),
            info,
        })));
        out
    }

    fn set_status(&mut self, name: &str, status: UserStatus) -> Vec<Directive> {
        match self.users.get_mut(name) {
            Some(user) => {
                user.status = status;
                vec![to_all(Message::UserUpdate(UserUpdateMsg::Status {
                    name: name.to_owned(),
                    status,
                }))]
            }
            None => Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(id: ConnId) -> ConnCtx {
        ConnCtx {
            id,
            addr: format!("10.0.0.{id}:40000").parse().unwrap(),
        }
    }

    fn join_ok(reg: &mut Registry, id: ConnId, name: &str) {
        let out = reg.join(ctx(id), name.into());
        match &out[0].msg {
            Message::Join(JoinMsg::Response { status, .. }) => {
                assert_eq!(*status, JoinStatus::Ok)
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    /// Drive alice→bob call formation to an active two-person call.
    fn two_person_call(reg: &mut Registry) -> CallInfo {
        join_ok(reg, 1, "alice");
        join_ok(reg, 2, "bob");
        reg.call_request(ctx(1), "bob");
        let out = reg.callee_response(ctx(2), "alice", CallResponse::Accept);
        match &out[0].msg {
            Message::CallUpdate(CallUpdateMsg::CallAdd { info, .. }) => info.clone(),
            other => panic!("expected call_add, got {other:?}"),
        }
    }

    #[test]
    fn scenario_join_empty_directory() {
        let mut reg = Registry::new();
        let out = reg.join(ctx(1), "alice".into());
        assert_eq!(out.len(), 2);
        match &out[0].msg {
            Message::Join(JoinMsg::Response {
                status,
                user_info_lst,
                call_info_lst,
                ..
            }) => {
                assert_eq!(*status, JoinStatus::Ok);
                assert!(user_info_lst.is_empty());
                assert!(call_info_lst.is_empty());
            }
            other => panic!("unexpected: {other:?}"),
        }

        // Bob joins; alice (and only alice) hears about it.
        let out = reg.join(ctx(2), "bob".into());
        let update = &out[1];
        assert_eq!(update.to, Recipients::AllExcept(2));
        assert_eq!(
            update.msg,
            Message::UserUpdate(UserUpdateMsg::Join { name: "bob".into() })
        );
        assert_eq!(reg.resolve(update.to), vec![1]);
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let mut reg = Registry::new();
        join_ok(&mut reg, 1, "alice");
        let out = reg.join(ctx(2), "alice".into());
        assert_eq!(out.len(), 1);
        match &out[0].msg {
            Message::Join(JoinMsg::Response { status, .. }) => {
                assert_eq!(*status, JoinStatus::No)
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(reg.user_count(), 1);
    }

    #[test]
    fn repeat_join_on_one_connection_is_rejected() {
        let mut reg = Registry::new();
        join_ok(&mut reg, 1, "alice");

        // The same connection asks for a second identity.
        let out = reg.join(ctx(1), "bob".into());
        assert_eq!(out.len(), 1);
        match &out[0].msg {
            Message::Join(JoinMsg::Response { status, .. }) => {
                assert_eq!(*status, JoinStatus::No)
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(reg.user_count(), 1);

        // Disconnect removes the one real identity; nothing lingers.
        let out = reg.disconnect(1);
        assert!(out.iter().any(|d| d.msg
            == Message::UserUpdate(UserUpdateMsg::Leave {
                name: "alice".into()
            })));
        assert_eq!(reg.user_count(), 0);

        // Both names are free again.
        join_ok(&mut reg, 2, "alice");
        join_ok(&mut reg, 3, "bob");
    }

    #[test]
    fn scenario_call_formation() {
        let mut reg = Registry::new();
        join_ok(&mut reg, 1, "alice");
        join_ok(&mut reg, 2, "bob");

        let out = reg.call_request(ctx(1), "bob");
        // Two status broadcasts plus the participate prompt to bob.
        assert_eq!(out.len(), 3);
        assert_eq!(out[2].to, Recipients::One(2));
        assert_eq!(
            out[2].msg,
            Message::Call(CallMsg::Participate {
                caller: "alice".into()
            })
        );

        let out = reg.callee_response(ctx(2), "alice", CallResponse::Accept);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to, Recipients::All, "idle users see the roster too");
        match &out[0].msg {
            Message::CallUpdate(CallUpdateMsg::CallAdd { master, info }) => {
                assert_eq!(master, "alice");
                assert_eq!(info.user_lst, vec!["alice", "bob"]);
                assert_eq!(info.key_addr.ip().to_string(), "10.0.0.1");
                assert_ne!(info.addrs.audio, info.addrs.video);
            }
            other => panic!("expected call_add: {other:?}"),
        }
        assert_eq!(reg.call_count(), 1);
    }

    #[test]
    fn busy_callee_rejects_immediately() {
        let mut reg = Registry::new();
        two_person_call(&mut reg);
        join_ok(&mut reg, 3, "carol");

        let out = reg.call_request(ctx(3), "bob");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to, Recipients::One(3));
        assert_eq!(
            out[0].msg,
            Message::Call(CallMsg::CalleeResponse {
                caller: "carol".into(),
                status: CallResponse::Reject,
            })
        );
    }

    #[test]
    fn reject_reverts_both_to_available() {
        let mut reg = Registry::new();
        join_ok(&mut reg, 1, "alice");
        join_ok(&mut reg, 2, "bob");
        reg.call_request(ctx(1), "bob");

        let out = reg.callee_response(ctx(2), "alice", CallResponse::Reject);
        let statuses: Vec<_> = out
            .iter()
            .filter_map(|d| match &d.msg {
                Message::UserUpdate(UserUpdateMsg::Status { name, status }) => {
                    Some((name.clone(), *status))
                }
                _ => None,
            })
            .collect();
        assert!(statuses.contains(&("alice".into(), UserStatus::Available)));
        assert!(statuses.contains(&("bob".into(), UserStatus::Available)));
        // The caller learns about the rejection.
        assert!(out
            .iter()
            .any(|d| d.to == Recipients::One(1)
                && matches!(
                    d.msg,
                    Message::Call(CallMsg::CalleeResponse {
                        status: CallResponse::Reject,
                        ..
                    })
                )));
        assert_eq!(reg.call_count(), 0);
    }

    #[test]
    fn exhausted_pool_rejects_the_accepted_call() {
        let mut reg = Registry::new();
        while reg.pool.allocate().is_some() {}

        join_ok(&mut reg, 1, "alice");
        join_ok(&mut reg, 2, "bob");
        reg.call_request(ctx(1), "bob");
        let out = reg.callee_response(ctx(2), "alice", CallResponse::Accept);

        // No call comes into existence; both users revert to available and
        // the caller hears a rejection.
        assert_eq!(reg.call_count(), 0);
        assert!(!out
            .iter()
            .any(|d| matches!(d.msg, Message::CallUpdate(_))));
        let statuses: Vec<_> = out
            .iter()
            .filter_map(|d| match &d.msg {
                Message::UserUpdate(UserUpdateMsg::Status { name, status }) => {
                    Some((name.clone(), *status))
                }
                _ => None,
            })
            .collect();
        assert!(statuses.contains(&("alice".into(), UserStatus::Available)));
        assert!(statuses.contains(&("bob".into(), UserStatus::Available)));
        assert!(out
            .iter()
            .any(|d| d.to == Recipients::One(1)
                && matches!(
                    d.msg,
                    Message::Call(CallMsg::CalleeResponse {
                        status: CallResponse::Reject,
                        ..
                    })
                )));
    }

    #[test]
    fn third_party_joins_existing_call() {
        let mut reg = Registry::new();
        two_person_call(&mut reg);
        join_ok(&mut reg, 3, "carol");

        // Alice, already in the call, dials carol; carol accepts and joins
        // alice's existing call.
        reg.call_request(ctx(1), "carol");
        let out = reg.callee_response(ctx(3), "alice", CallResponse::Accept);
        match &out[0].msg {
            Message::CallUpdate(CallUpdateMsg::UserJoin { master, name, info }) => {
                assert_eq!(master, "alice");
                assert_eq!(name, "carol");
                assert_eq!(info.user_lst, vec!["alice", "bob", "carol"]);
            }
            other => panic!("expected user_join: {other:?}"),
        }
    }

    #[test]
    fn scenario_leave_dissolves_two_person_call() {
        let mut reg = Registry::new();
        let info = two_person_call(&mut reg);

        let out = reg.leave(ctx(1));
        assert!(out.iter().any(|d| matches!(
            &d.msg,
            Message::CallUpdate(CallUpdateMsg::CallRemove { master }) if master == "alice"
        )));
        // Bob reverts to available.
        assert!(out.iter().any(|d| d.msg
            == Message::UserUpdate(UserUpdateMsg::Status {
                name: "bob".into(),
                status: UserStatus::Available,
            })));
        assert_eq!(reg.call_count(), 0);

        // The freed triple is recycled for the next call.
        join_ok(&mut reg, 3, "carol");
        reg.call_request(ctx(2), "carol");
        let out = reg.callee_response(ctx(3), "bob", CallResponse::Accept);
        match &out[0].msg {
            Message::CallUpdate(CallUpdateMsg::CallAdd { info: new, .. }) => {
                assert_eq!(new.addrs, info.addrs);
            }
            other => panic!("expected call_add: {other:?}"),
        }
    }

    #[test]
    fn master_migration_promotes_earliest_joined() {
        let mut reg = Registry::new();
        two_person_call(&mut reg);
        join_ok(&mut reg, 3, "carol");
        reg.call_request(ctx(1), "carol");
        reg.callee_response(ctx(3), "alice", CallResponse::Accept);

        let out = reg.leave(ctx(1)); // alice (master) leaves a 3-person call
        let update = out
            .iter()
            .find_map(|d| match &d.msg {
                Message::CallUpdate(CallUpdateMsg::UserLeave { master, name, info }) => {
                    Some((master.clone(), name.clone(), info.clone()))
                }
                _ => None,
            })
            .expect("user_leave directive");
        assert_eq!(update.0, "bob", "earliest-joined participant is promoted");
        assert_eq!(update.1, "alice");
        assert_eq!(update.2.user_lst, vec!["bob", "carol"]);
        assert_eq!(update.2.key_addr.ip().to_string(), "10.0.0.2");
        assert_eq!(reg.call_count(), 1);
    }

    #[test]
    fn disconnect_cascades_call_cleanup() {
        let mut reg = Registry::new();
        two_person_call(&mut reg);

        let out = reg.disconnect(1);
        assert!(out.iter().any(|d| matches!(
            d.msg,
            Message::CallUpdate(CallUpdateMsg::CallRemove { .. })
        )));
        assert!(out.iter().any(|d| d.msg
            == Message::UserUpdate(UserUpdateMsg::Leave {
                name: "alice".into()
            })));
        assert_eq!(reg.user_count(), 1);
        assert_eq!(reg.call_count(), 0);
    }

    #[test]
    fn user_count_tracks_joins_minus_leaves() {
        let mut reg = Registry::new();
        for i in 0..5 {
            join_ok(&mut reg, i, &format!("user{i}"));
        }
        reg.disconnect(2);
        reg.disconnect(4);
        assert_eq!(reg.user_count(), 3);
        // A name freed by disconnect can join again.
        join_ok(&mut reg, 9, "user2");
        assert_eq!(reg.user_count(), 4);
    }

    #[test]
    fn unknown_connection_is_ignored() {
        let mut reg = Registry::new();
        assert!(reg.call_request(ctx(77), "nobody").is_empty());
        assert!(reg.leave(ctx(77)).is_empty());
        assert!(reg.disconnect(77).is_empty());
    }
}
