//! The ACL data channel
//!
//! Outbound ACL traffic is queued per the caller's priority and paced against the
//! controller's buffer capacity. The controller reports how many packets it can hold for each
//! buffer (one shared buffer, or separate BR/EDR and LE buffers); a packet is only written to
//! the endpoint when its buffer has a free slot, and slots come back through the number of
//! completed packets event.
//!
//! A connection handle must be registered before data for it is accepted, and unregistering
//! drops whatever is still queued for the handle. Packets already inside the controller are
//! not affected by unregistration; their slots return either through number of completed
//! packets or, after a disconnection, through [`clear_controller_packet_count`]
//! (AclDataChannel::clear_controller_packet_count).

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::hci::command_channel::{CommandChannel, EventHandlerVerdict};
use crate::hci::common::{ConnectionHandle, LinkType};
use crate::hci::events::{Events, EventsData, NumberOfCompletedPacketsData};
use crate::hci::HciAclData;
use crate::transport::HciEndpoint;

/// One controller data buffer: the largest payload it takes and how many packets it holds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataBufferInfo {
    max_data_length: usize,
    max_packet_count: usize,
}

impl DataBufferInfo {
    pub fn new(max_data_length: usize, max_packet_count: usize) -> Self {
        DataBufferInfo { max_data_length, max_packet_count }
    }

    pub fn get_max_data_length(&self) -> usize {
        self.max_data_length
    }

    pub fn get_max_packet_count(&self) -> usize {
        self.max_packet_count
    }

    /// Check if this buffer actually exists on the controller
    pub fn is_available(&self) -> bool {
        self.max_packet_count != 0
    }
}

/// Ordering class of a queued outbound packet
///
/// High priority packets are dispatched ahead of every queued low priority packet; within one
/// class dispatch is in enqueue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketPriority {
    Low,
    High,
}

/// Identifier of the upper layer channel a packet belongs to, used only for revocation
pub type ChannelId = u16;

/// An entry of the outbound send queue
pub struct QueuedDataPacket {
    /// Snapshot of the link type at enqueue time
    link_type: LinkType,
    channel_id: ChannelId,
    priority: PacketPriority,
    packet: HciAclData,
}

impl QueuedDataPacket {
    pub fn get_handle(&self) -> ConnectionHandle {
        self.packet.get_handle()
    }

    pub fn get_channel_id(&self) -> ChannelId {
        self.channel_id
    }

    pub fn get_priority(&self) -> PacketPriority {
        self.priority
    }
}

/// Packets for one handle sitting in the controller's buffer
struct PendingPacketData {
    link_type: LinkType,
    count: usize,
}

/// Which buffer a packet draws its credit from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BufferPool {
    BrEdr,
    Le,
}

struct SendState {
    bredr_buffer: DataBufferInfo,
    le_buffer: DataBufferInfo,
    send_queue: VecDeque<QueuedDataPacket>,
    registered_links: BTreeMap<ConnectionHandle, LinkType>,
    pending_links: BTreeMap<ConnectionHandle, PendingPacketData>,
    outstanding_bredr: usize,
    outstanding_le: usize,
    initialized: bool,
    closed: bool,
}

impl SendState {
    fn pool_of(&self, link_type: LinkType) -> BufferPool {
        if link_type.is_le() && self.le_buffer.is_available() {
            BufferPool::Le
        } else {
            BufferPool::BrEdr
        }
    }

    fn buffer_of(&self, pool: BufferPool) -> &DataBufferInfo {
        match pool {
            BufferPool::BrEdr => &self.bredr_buffer,
            BufferPool::Le => &self.le_buffer,
        }
    }

    fn outstanding_of(&mut self, pool: BufferPool) -> &mut usize {
        match pool {
            BufferPool::BrEdr => &mut self.outstanding_bredr,
            BufferPool::Le => &mut self.outstanding_le,
        }
    }

    fn free_slots(&self, pool: BufferPool) -> usize {
        let outstanding = match pool {
            BufferPool::BrEdr => self.outstanding_bredr,
            BufferPool::Le => self.outstanding_le,
        };

        self.buffer_of(pool).get_max_packet_count().saturating_sub(outstanding)
    }
}

type DataRxHandler = Box<dyn FnMut(HciAclData) + Send>;

pub struct AclDataChannel {
    send: Mutex<SendState>,
    receive: Mutex<Option<DataRxHandler>>,
    endpoint: Arc<dyn HciEndpoint>,
}

impl AclDataChannel {
    pub fn new(endpoint: Arc<dyn HciEndpoint>) -> Self {
        AclDataChannel {
            send: Mutex::new(SendState {
                bredr_buffer: DataBufferInfo::default(),
                le_buffer: DataBufferInfo::default(),
                send_queue: VecDeque::new(),
                registered_links: BTreeMap::new(),
                pending_links: BTreeMap::new(),
                outstanding_bredr: 0,
                outstanding_le: 0,
                initialized: false,
                closed: false,
            }),
            receive: Mutex::new(None),
            endpoint,
        }
    }

    /// Wire the channel into the command channel's event flow
    ///
    /// Registers the internal handlers for number of completed packets and data buffer
    /// overflow. Must be called once, before traffic flows.
    pub fn attach(this: &Arc<Self>, commands: &CommandChannel) {
        let channel = this.clone();

        commands.add_internal_event_handler(Events::NumberOfCompletedPackets, move |event| {
            if let EventsData::NumberOfCompletedPackets(ref data) = event {
                channel.on_number_of_completed_packets(data);
            }

            EventHandlerVerdict::Continue
        });

        commands.add_internal_event_handler(Events::DataBufferOverflow, |event| {
            if let EventsData::DataBufferOverflow(ref data) = event {
                log::error!("controller ACL buffer overflow on {:?} traffic", data.link_type);
            }

            EventHandlerVerdict::Continue
        });
    }

    /// Install the controller's buffer capacities
    ///
    /// `le_buffer` is `None` when the controller reports a single shared buffer, in which
    /// case LE traffic draws from the BR/EDR pool.
    pub fn initialize(&self, bredr_buffer: DataBufferInfo, le_buffer: Option<DataBufferInfo>) {
        let mut send = self.lock_send();

        send.bredr_buffer = bredr_buffer;
        send.le_buffer = le_buffer.unwrap_or_default();
        send.initialized = true;

        log::info!(
            "ACL data channel initialized, BR/EDR buffer {:?}, LE buffer {:?}",
            send.bredr_buffer,
            send.le_buffer,
        );
    }

    /// Install the single upper layer receive handler, replacing any previous one
    pub fn set_data_rx_handler<C>(&self, handler: C)
    where
        C: FnMut(HciAclData) + Send + 'static,
    {
        *self.receive.lock().expect("ACL receive lock poisoned") = Some(Box::new(handler));
    }

    /// Accept outbound traffic for a handle
    pub fn register_link(&self, handle: ConnectionHandle, link_type: LinkType) {
        let mut send = self.lock_send();

        if send.registered_links.insert(handle, link_type).is_some() {
            log::warn!("link {:#05X} registered twice", handle.get_raw_handle());
        }
    }

    /// Stop accepting traffic for a handle and drop whatever is queued for it
    ///
    /// Packets already in the controller keep their slots until their completions arrive.
    pub fn unregister_link(&self, handle: ConnectionHandle) {
        let mut send = self.lock_send();

        send.registered_links.remove(&handle);

        send.send_queue.retain(|queued| queued.get_handle() != handle);
    }

    /// Reclaim the controller slots still attributed to a handle
    ///
    /// Called by the upper layer when it sees the disconnection complete for the handle; the
    /// controller has flushed the link's packets, but sends no completions for them.
    pub fn clear_controller_packet_count(&self, handle: ConnectionHandle) {
        let mut send = self.lock_send();

        if let Some(pending) = send.pending_links.remove(&handle) {
            let pool = send.pool_of(pending.link_type);

            let outstanding = send.outstanding_of(pool);

            *outstanding = outstanding.saturating_sub(pending.count);

            log::trace!(
                "cleared {} outstanding packets for handle {:#05X}",
                pending.count,
                handle.get_raw_handle()
            );

            self.dispatch_queued(&mut send);
        }
    }

    /// Queue one packet, see [`send_packets`](AclDataChannel::send_packets)
    pub fn send_packet(
        &self,
        packet: HciAclData,
        channel_id: ChannelId,
        priority: PacketPriority,
    ) -> bool {
        self.send_packets(vec![packet], channel_id, priority)
    }

    /// Queue a batch of packets atomically
    ///
    /// Either every packet passes validation (registered handle, payload within the buffer's
    /// limit) and the whole batch is queued, or nothing is. Validation and enqueue run under
    /// one lock acquisition so a registration change can never split a batch.
    pub fn send_packets(
        &self,
        packets: Vec<HciAclData>,
        channel_id: ChannelId,
        priority: PacketPriority,
    ) -> bool {
        let mut send = self.lock_send();

        if !send.initialized || send.closed {
            log::warn!("ACL packets dropped, data channel not ready");
            return false;
        }

        let mut link_types = Vec::with_capacity(packets.len());

        for packet in packets.iter() {
            let link_type = match send.registered_links.get(&packet.get_handle()) {
                Some(&link_type) => link_type,
                None => {
                    log::warn!(
                        "dropping ACL batch, handle {:#05X} is not registered",
                        packet.get_handle().get_raw_handle()
                    );
                    return false;
                }
            };

            let pool = send.pool_of(link_type);

            if packet.get_payload().len() > send.buffer_of(pool).get_max_data_length() {
                log::warn!(
                    "dropping ACL batch, payload of {} exceeds the buffer limit",
                    packet.get_payload().len()
                );
                return false;
            }

            link_types.push(link_type);
        }

        // high priority packets go behind the existing high entries, ahead of every low one
        let mut insert_at = match priority {
            PacketPriority::Low => send.send_queue.len(),
            PacketPriority::High => send
                .send_queue
                .iter()
                .position(|queued| queued.priority == PacketPriority::Low)
                .unwrap_or(send.send_queue.len()),
        };

        for (packet, link_type) in packets.into_iter().zip(link_types) {
            send.send_queue
                .insert(insert_at, QueuedDataPacket { link_type, channel_id, priority, packet });

            insert_at += 1;
        }

        self.dispatch_queued(&mut send);

        true
    }

    /// Drop queued packets matching a predicate
    ///
    /// Used when an upper layer channel closes; the predicate typically matches on the
    /// channel id.
    pub fn drop_queued_packets<F>(&self, mut predicate: F)
    where
        F: FnMut(&QueuedDataPacket) -> bool,
    {
        self.lock_send().send_queue.retain(|queued| !predicate(queued));
    }

    pub fn get_buffer_info(&self) -> DataBufferInfo {
        self.lock_send().bredr_buffer
    }

    /// The buffer LE traffic draws from
    ///
    /// This is the BR/EDR buffer when the controller reports a single shared one.
    pub fn get_le_buffer_info(&self) -> DataBufferInfo {
        let send = self.lock_send();

        if send.le_buffer.is_available() {
            send.le_buffer
        } else {
            send.bredr_buffer
        }
    }

    /// Feed one framed inbound packet from the data endpoint
    pub fn receive_packet(&self, packet: HciAclData) {
        let mut receive = self.receive.lock().expect("ACL receive lock poisoned");

        match receive.as_mut() {
            Some(handler) => handler(packet),
            None => log::warn!(
                "dropping inbound ACL packet for handle {:#05X}, no receive handler",
                packet.get_handle().get_raw_handle()
            ),
        }
    }

    /// Apply a number of completed packets event
    pub(crate) fn on_number_of_completed_packets(&self, data: &NumberOfCompletedPacketsData) {
        let mut send = self.lock_send();

        for entry in data.completed_packets.iter() {
            let (dec, link_type, emptied) = match send.pending_links.get_mut(&entry.connection_handle)
            {
                Some(pending) => {
                    let reported = entry.completed_packets as usize;

                    if reported > pending.count {
                        log::warn!(
                            "controller reported {} completions for handle {:#05X} with {} outstanding",
                            reported,
                            entry.connection_handle.get_raw_handle(),
                            pending.count
                        );
                    }

                    let dec = reported.min(pending.count);

                    pending.count -= dec;

                    (dec, pending.link_type, pending.count == 0)
                }
                None => {
                    log::trace!(
                        "ignoring completions for unknown handle {:#05X}",
                        entry.connection_handle.get_raw_handle()
                    );
                    continue;
                }
            };

            if emptied {
                send.pending_links.remove(&entry.connection_handle);
            }

            let pool = send.pool_of(link_type);

            let outstanding = send.outstanding_of(pool);

            *outstanding = outstanding.saturating_sub(dec);
        }

        self.dispatch_queued(&mut send);
    }

    /// Send queued packets while their buffers have free slots
    fn dispatch_queued(&self, send: &mut MutexGuard<SendState>) {
        if send.closed {
            return;
        }

        let mut index = 0;

        while index < send.send_queue.len() {
            let handle = send.send_queue[index].get_handle();

            // the link may have been unregistered since this packet was queued
            if !send.registered_links.contains_key(&handle) {
                send.send_queue.remove(index);
                continue;
            }

            let link_type = send.send_queue[index].link_type;
            let pool = send.pool_of(link_type);

            if send.free_slots(pool) == 0 {
                index += 1;
                continue;
            }

            let queued = match send.send_queue.remove(index) {
                Some(queued) => queued,
                None => return,
            };

            if let Err(e) = self.endpoint.send(&queued.packet.into_packet()) {
                log::error!("failed to send ACL packet: {}", e);

                send.closed = true;
                return;
            }

            *send.outstanding_of(pool) += 1;

            let pending = send
                .pending_links
                .entry(handle)
                .or_insert(PendingPacketData { link_type, count: 0 });

            pending.count += 1;
        }
    }

    /// Stop all traffic through the channel
    pub fn shut_down(&self) {
        let mut send = self.lock_send();

        send.closed = true;
        send.send_queue.clear();
    }

    fn lock_send(&self) -> MutexGuard<SendState> {
        self.send.lock().expect("ACL send lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hci::{AclBroadcastFlag, AclPacketBoundary};
    use crate::test_util::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn data_channel(buffer: DataBufferInfo) -> (Arc<AclDataChannel>, Arc<FakeEndpoint>) {
        let endpoint = FakeEndpoint::new();

        let channel = Arc::new(AclDataChannel::new(endpoint.clone() as Arc<dyn HciEndpoint>));

        channel.initialize(buffer, None);

        (channel, endpoint)
    }

    fn handle(raw: u16) -> ConnectionHandle {
        ConnectionHandle::try_from(raw).unwrap()
    }

    fn packet(raw_handle: u16, payload: &[u8]) -> HciAclData {
        HciAclData::new(
            handle(raw_handle),
            AclPacketBoundary::FirstNonFlushable,
            AclBroadcastFlag::NoBroadcast,
            Box::from(payload),
        )
    }

    fn completions(pairs: &[(u16, u16)]) -> NumberOfCompletedPacketsData {
        use crate::hci::events::NumberOfCompletedPacketsPair;

        NumberOfCompletedPacketsData {
            completed_packets: pairs
                .iter()
                .map(|&(raw_handle, count)| NumberOfCompletedPacketsPair {
                    connection_handle: handle(raw_handle),
                    completed_packets: count,
                })
                .collect(),
        }
    }

    #[test]
    fn credit_gated_sending() {
        let (channel, endpoint) = data_channel(DataBufferInfo::new(1024, 5));

        channel.register_link(handle(1), LinkType::ACLConnection);

        for _ in 0..7 {
            assert!(channel.send_packet(packet(1, &[0xAB]), 0x40, PacketPriority::Low));
        }

        // exactly the buffer capacity goes out
        assert_eq!(endpoint.sent_count(), 5);

        channel.on_number_of_completed_packets(&completions(&[(1, 2)]));

        assert_eq!(endpoint.sent_count(), 7);
    }

    #[test]
    fn high_priority_overtakes_queued_low() {
        let (channel, endpoint) = data_channel(DataBufferInfo::new(1024, 3));

        channel.register_link(handle(1), LinkType::ACLConnection);

        // fill the controller buffer
        for _ in 0..3 {
            channel.send_packet(packet(1, &[0x00]), 0x40, PacketPriority::Low);
        }

        assert_eq!(endpoint.take_sent().len(), 3);

        for tag in 1..=3u8 {
            channel.send_packet(packet(1, &[tag]), 0x40, PacketPriority::Low);
        }

        channel.send_packet(packet(1, &[0xFF]), 0x41, PacketPriority::High);

        // one slot frees up, the high priority packet takes it
        channel.on_number_of_completed_packets(&completions(&[(1, 1)]));

        let sent = endpoint.take_sent();

        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0][4], 0xFF);
    }

    #[test]
    fn unregistered_handle_is_rejected() {
        let (channel, endpoint) = data_channel(DataBufferInfo::new(1024, 5));

        assert!(!channel.send_packet(packet(1, &[1]), 0x40, PacketPriority::Low));
        assert_eq!(endpoint.sent_count(), 0);

        channel.register_link(handle(1), LinkType::ACLConnection);

        assert!(channel.send_packet(packet(1, &[1]), 0x40, PacketPriority::Low));

        channel.unregister_link(handle(1));

        assert!(!channel.send_packet(packet(1, &[1]), 0x40, PacketPriority::Low));

        // reuse after a later registration is fine
        channel.register_link(handle(1), LinkType::ACLConnection);

        assert!(channel.send_packet(packet(1, &[1]), 0x40, PacketPriority::Low));
    }

    #[test]
    fn batch_is_all_or_nothing() {
        let (channel, endpoint) = data_channel(DataBufferInfo::new(1024, 5));

        channel.register_link(handle(1), LinkType::ACLConnection);

        let batch = vec![packet(1, &[1]), packet(2, &[2])];

        assert!(!channel.send_packets(batch, 0x40, PacketPriority::Low));
        assert_eq!(endpoint.sent_count(), 0);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let (channel, endpoint) = data_channel(DataBufferInfo::new(4, 5));

        channel.register_link(handle(1), LinkType::ACLConnection);

        assert!(!channel.send_packet(packet(1, &[0; 5]), 0x40, PacketPriority::Low));
        assert!(channel.send_packet(packet(1, &[0; 4]), 0x40, PacketPriority::Low));
        assert_eq!(endpoint.sent_count(), 1);
    }

    #[test]
    fn unregister_drops_queued_but_not_pending() {
        let (channel, endpoint) = data_channel(DataBufferInfo::new(1024, 1));

        channel.register_link(handle(1), LinkType::ACLConnection);
        channel.register_link(handle(2), LinkType::ACLConnection);

        channel.send_packet(packet(1, &[1]), 0x40, PacketPriority::Low);
        channel.send_packet(packet(1, &[2]), 0x40, PacketPriority::Low);
        channel.send_packet(packet(2, &[3]), 0x41, PacketPriority::Low);

        assert_eq!(endpoint.take_sent().len(), 1);

        channel.unregister_link(handle(1));

        // handle 1 still owns the controller slot, nothing can go out yet
        channel.on_number_of_completed_packets(&completions(&[(1, 1)]));

        // the queued packet for handle 1 was revoked, handle 2's goes out instead
        let sent = endpoint.take_sent();

        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0][4], 3);
    }

    #[test]
    fn clear_packet_count_returns_credits() {
        let (channel, endpoint) = data_channel(DataBufferInfo::new(1024, 2));

        channel.register_link(handle(1), LinkType::ACLConnection);
        channel.register_link(handle(2), LinkType::ACLConnection);

        channel.send_packet(packet(1, &[1]), 0x40, PacketPriority::Low);
        channel.send_packet(packet(1, &[2]), 0x40, PacketPriority::Low);
        channel.send_packet(packet(2, &[3]), 0x41, PacketPriority::Low);

        assert_eq!(endpoint.take_sent().len(), 2);

        channel.unregister_link(handle(1));
        channel.clear_controller_packet_count(handle(1));

        // both slots return at once and the other link's packet uses one
        let sent = endpoint.take_sent();

        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0][4], 3);
    }

    #[test]
    fn completions_for_unknown_handle_are_ignored() {
        let (channel, endpoint) = data_channel(DataBufferInfo::new(1024, 1));

        channel.register_link(handle(1), LinkType::ACLConnection);
        channel.send_packet(packet(1, &[1]), 0x40, PacketPriority::Low);
        channel.send_packet(packet(1, &[2]), 0x40, PacketPriority::Low);

        channel.on_number_of_completed_packets(&completions(&[(9, 4)]));

        // no credit was freed
        assert_eq!(endpoint.sent_count(), 1);
    }

    #[test]
    fn separate_le_pool() {
        let endpoint = FakeEndpoint::new();
        let channel = Arc::new(AclDataChannel::new(endpoint.clone() as Arc<dyn HciEndpoint>));

        channel.initialize(DataBufferInfo::new(1024, 1), Some(DataBufferInfo::new(27, 2)));

        channel.register_link(handle(1), LinkType::ACLConnection);
        channel.register_link(handle(2), LinkType::LEConnection);

        channel.send_packet(packet(1, &[1]), 0x40, PacketPriority::Low);
        channel.send_packet(packet(1, &[2]), 0x40, PacketPriority::Low);

        // the BR/EDR pool is exhausted, the LE pool is not
        assert_eq!(endpoint.sent_count(), 1);

        channel.send_packet(packet(2, &[3]), 0x41, PacketPriority::Low);
        channel.send_packet(packet(2, &[4]), 0x41, PacketPriority::Low);

        assert_eq!(endpoint.sent_count(), 3);

        assert_eq!(channel.get_le_buffer_info(), DataBufferInfo::new(27, 2));
    }

    #[test]
    fn shared_buffer_serves_le() {
        let (channel, endpoint) = data_channel(DataBufferInfo::new(1024, 2));

        channel.register_link(handle(1), LinkType::LEConnection);

        channel.send_packet(packet(1, &[1]), 0x40, PacketPriority::Low);

        assert_eq!(endpoint.sent_count(), 1);
        assert_eq!(channel.get_le_buffer_info(), DataBufferInfo::new(1024, 2));
    }

    #[test]
    fn drop_queued_packets_by_channel() {
        let (channel, endpoint) = data_channel(DataBufferInfo::new(1024, 1));

        channel.register_link(handle(1), LinkType::ACLConnection);

        channel.send_packet(packet(1, &[1]), 0x40, PacketPriority::Low);
        channel.send_packet(packet(1, &[2]), 0x40, PacketPriority::Low);
        channel.send_packet(packet(1, &[3]), 0x41, PacketPriority::Low);

        assert_eq!(endpoint.take_sent().len(), 1);

        channel.drop_queued_packets(|queued| queued.get_channel_id() == 0x40);

        channel.on_number_of_completed_packets(&completions(&[(1, 1)]));

        let sent = endpoint.take_sent();

        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0][4], 3);
    }

    #[test]
    fn rx_handler_takes_ownership() {
        let (channel, _endpoint) = data_channel(DataBufferInfo::new(1024, 1));

        let received = Arc::new(AtomicUsize::new(0));
        let received_clone = received.clone();

        channel.set_data_rx_handler(move |data| {
            assert_eq!(data.get_payload(), &[0xAA, 0xBB]);
            received_clone.fetch_add(1, Ordering::SeqCst);
        });

        channel.receive_packet(packet(1, &[0xAA, 0xBB]));

        assert_eq!(received.load(Ordering::SeqCst), 1);
    }
}
