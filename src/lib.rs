//! This module contains the implementation of the CCSDS File Delivery Protocol (CFDP) high level
//! abstractions as specified in CCSDS 727.0-B-5.
//!
//! The basic idea of CFDP is to convert files of any size into a stream of packets called packet
//! data units (PDU). CFDP has an unacknowledged and acknowledged mode, with the option to request
//! a transaction closure for the unacknowledged mode. Using the unacknowledged mode with no
//! transaction closure is applicable for simplex communication paths, while the unacknowledged
//! mode with closure is the easiest way to get a confirmation of a successful file transfer,
//! including a CRC check on the remote side to verify file integrity. The acknowledged mode is
//! the most complex mode which includes multiple mechanisms to ensure succesfull packet
//! transaction even for unreliable connections, including lost segment detection. As such, it can
//! be compared to a specialized TCP for file transfers with remote systems.
//!
//! The goal of this library is to be flexible enough to support the use-cases of both on-board
//! software and of ground software. It has support to make integration on [std] systems as simple
//! as possible, but also has sufficient abstraction to allow for integration on `no_std`
//! environments. It is recommended to activate the `alloc` feature at the very least to allow
//! using the primary components provided by this crate. These components will only allocate
//! memory at initialization time and thus are still viable for systems where run-time allocation
//! is prohibited.
//!
//! The core of this library are the [crate::dest::DestinationHandler] and the
//! [crate::source::SourceHandler] components which model the CFDP destination and source entity
//! respectively. You can find high-level and API documentation for both handlers in the
//! respective [crate::dest] and [crate::source] module.
//!
//! The handlers do not own the transmission link, the system clock or the local filesystem:
//!
//! * Generated PDUs are placed into an internal queue and retrieved by the user with the
//!   `get_next_pdu` method of the respective handler, to be forwarded through an arbitrary
//!   transport layer.
//! * The current time is passed into each state machine call as a monotonic [core::time::Duration]
//!   timestamp. All timer decisions derive from this value and the [time::Countdown] instances
//!   created by a user-provided [TimerCreator].
//! * All filesystem accesses are performed through the [filestore::VirtualFilestore] abstraction.
//!
//! Both handlers are driven by periodic calls of their `state_machine` method, which is also
//! used to insert received packets. The handlers do not support concurrency out of the box.
//! Instead, if concurrent handling is required, it is recommended to create new handlers and
//! run all active handlers inside a thread pool, or move the newly created handler to a new
//! thread.
#![no_std]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#[cfg(feature = "alloc")]
extern crate alloc;
#[cfg(any(feature = "std", test))]
extern crate std;

#[cfg(feature = "std")]
pub mod dest;
#[cfg(feature = "alloc")]
pub mod filestore;
pub mod request;
pub mod segments;
#[cfg(feature = "std")]
pub mod source;
pub mod time;
pub mod user;

use crate::time::{Countdown, MonotonicCountdown};
use core::{cell::RefCell, fmt::Debug, hash::Hash, time::Duration};
use crc::{Crc, CRC_32_ISCSI, CRC_32_ISO_HDLC};
#[cfg(feature = "std")]
use hashbrown::HashMap;

#[cfg(feature = "alloc")]
pub use alloc_mod::*;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use spacepackets::{
    cfdp::{
        pdu::{FileDirectiveType, PduError, PduHeader},
        ChecksumType, ConditionCode, FaultHandlerCode, PduType, TransmissionMode,
    },
    util::{UnsignedByteField, UnsignedEnum},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum EntityType {
    Sending,
    Receiving,
}

/// Context information passed to a [TimerCreator] when a handler needs a new countdown timer.
///
/// The countdown timers are used by 3 mechanisms of the CFDP protocol.
///
/// ## 1. Check limit handling
///
/// The first mechanism is the check limit handling for unacknowledged transfers as specified
/// in 4.6.3.2 and 4.6.3.3 of the CFDP standard.
///
/// For the sending entity, this timer determines the expiry period for declaring a check limit
/// fault after sending an EOF PDU with requested closure. This allows a timeout of the transfer.
/// Also see 4.6.3.2 of the CFDP standard.
///
/// For the receiving entity, this timer determines the expiry period for incrementing a check
/// counter after an EOF PDU is received for an incomplete file transfer. This allows out-of-order
/// reception of file data PDUs and EOF PDUs. Also see 4.6.3.3 of the CFDP standard.
///
/// ## 2. NAK activity limit
///
/// The timer will be used to perform the NAK activity check as specified in 4.6.4.7 of the CFDP
/// standard. The expiration period will be provided by the NAK timer expiration limit of the
/// remote entity configuration.
///
/// ## 3. Positive ACK procedures
///
/// The timer will be used to perform the Positive Acknowledgement Procedures as specified in
/// 4.7.1 of the CFDP standard. The expiration period will be provided by the Positive ACK timer
/// interval of the remote entity configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TimerContext {
    CheckLimit { expiry_time: Duration },
    NakActivity { expiry_time: Duration },
    PositiveAck { expiry_time: Duration },
}

/// A generic trait which allows CFDP entities to create the countdown timers required to
/// implement special procedures like positive acknowledgement or check limit handling.
///
/// This allows the creation of different timer instances depending on the context and purpose of
/// the timer and the runtime environment. The expiry periods themselves are taken from the
/// [RemoteEntityConfig] of the remote entity the handler is communicating with. The `now`
/// argument is the monotonic timestamp of the state machine call which triggered the timer
/// creation, and will also be the arming time of the created timer.
pub trait TimerCreator {
    type Countdown: Countdown;

    fn create_countdown(&self, timer_context: TimerContext, now: Duration) -> Self::Countdown;
}

/// Default [TimerCreator] which creates [MonotonicCountdown] timers driven purely by the
/// `now` timestamps the user passes into the handler state machines.
#[derive(Debug, Default)]
pub struct MonotonicTimerCreator {}

impl TimerCreator for MonotonicTimerCreator {
    type Countdown = MonotonicCountdown;

    fn create_countdown(&self, timer_context: TimerContext, now: Duration) -> Self::Countdown {
        match timer_context {
            TimerContext::CheckLimit { expiry_time }
            | TimerContext::NakActivity { expiry_time }
            | TimerContext::PositiveAck { expiry_time } => {
                MonotonicCountdown::new(expiry_time, now)
            }
        }
    }
}

/// This structure models the remote entity configuration information as specified in chapter 8.3
/// of the CFDP standard. It is the management information base (MIB) entry for one remote
/// entity.
///
/// Some of the fields which were not considered necessary for the Rust implementation
/// were omitted. Some other fields which are not contained inside the standard but are considered
/// necessary for the Rust implementation are included.
///
/// ## Notes on Positive Acknowledgment Procedures
///
/// The `positive_ack_timer_interval` and `positive_ack_timer_expiration_limit` will
/// be used for positive acknowledgement procedures as specified in CFDP chapter 4.7. The sending
/// entity will start the timer for any PDUs where an acknowledgment is required (e.g. EOF PDU).
/// Once the expected ACK response has not been received for that interval, a counter will be
/// incremented and the timer will be reset. Once the counter exceeds the
/// `positive_ack_timer_expiration_limit`, a Positive ACK Limit Reached fault will be declared.
///
/// ## Notes on Deferred Lost Segment Procedures
///
/// This procedure will be active if an EOF (No Error) PDU is received in acknowledged mode. After
/// issuing the NAK sequence which has the whole file scope, a timer will be started. The timer is
/// reset when missing segments or missing metadata is received. The timer will be deactivated if
/// all missing data is received. If the timer expires, a new NAK sequence will be issued and a
/// counter will be incremented, which can lead to a NAK Limit Reached fault being declared.
///
/// ## Fields
///
/// * `entity_id` - The ID of the remote entity.
/// * `max_packet_len` - This determines the maximum length of all PDUs generated for that remote
///   entity in addition to the `max_file_segment_len` attribute which also determines the size of
///   file data PDUs.
/// * `max_file_segment_len` - The maximum file segment length which determines the maximum size
///   of file data PDUs in addition to the `max_packet_len` attribute. If this field is set
///   to None, the maximum file segment length will be derived from the maximum packet length.
///   If this has some value which is smaller than the segment value derived from
///   `max_packet_len`, this value will be picked.
/// * `closure_requested_by_default` - If the closure requested field is not supplied as part of
///   the Put Request, it will be determined from this field in the remote configuration.
/// * `crc_on_transmission_by_default` - If the CRC option is not supplied as part of the Put
///   Request, it will be determined from this field in the remote configuration.
/// * `default_transmission_mode` - If the transmission mode is not supplied as part of the
///   Put Request, it will be determined from this field in the remote configuration.
/// * `default_crc_type` - Default checksum type used to calculate for all file transmissions to
///   this remote entity.
/// * `check_timer_interval` - Expiry period of the check timer used for incomplete unacknowledged
///   transfers, also see [TimerContext::CheckLimit]. Defaults to 5 seconds.
/// * `check_limit` - This counter limit determines how often the check timer may expire before
///   a Check Limit Reached fault is declared. Also see 4.6.3.3 of the CFDP standard. Defaults to
///   2, so the check limit timer may expire twice.
/// * `positive_ack_timer_interval` - See the notes on the Positive Acknowledgment Procedures
///   inside the struct documentation. Defaults to 10 seconds.
/// * `positive_ack_timer_expiration_limit` - See the notes on the Positive Acknowledgment
///   Procedures inside the struct documentation. Defaults to 2, so the timer may expire twice.
/// * `immediate_nak_mode` - Specifies whether a NAK sequence should be issued immediately when a
///   file data gap or lost metadata is detected in the acknowledged mode. Defaults to true.
/// * `nak_timer_interval` - See the notes on the Deferred Lost Segment Procedure inside the
///   struct documentation. Defaults to 10 seconds.
/// * `nak_timer_expiration_limit` - See the notes on the Deferred Lost Segment Procedure inside
///   the struct documentation. Defaults to 2, so the timer may expire two times.
/// * `disposition_on_cancellation` - Determines whether an incomplete received file is discarded
///   on transaction cancellation. Defaults to false.
#[derive(Debug, Copy, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RemoteEntityConfig {
    pub entity_id: UnsignedByteField,
    pub max_packet_len: usize,
    pub max_file_segment_len: Option<usize>,
    pub closure_requested_by_default: bool,
    pub crc_on_transmission_by_default: bool,
    pub default_transmission_mode: TransmissionMode,
    pub default_crc_type: ChecksumType,
    pub check_timer_interval: Duration,
    pub check_limit: u32,
    pub positive_ack_timer_interval: Duration,
    pub positive_ack_timer_expiration_limit: u32,
    pub immediate_nak_mode: bool,
    pub nak_timer_interval: Duration,
    pub nak_timer_expiration_limit: u32,
    pub disposition_on_cancellation: bool,
}

impl RemoteEntityConfig {
    pub fn new_with_default_values(
        entity_id: UnsignedByteField,
        max_packet_len: usize,
        closure_requested_by_default: bool,
        crc_on_transmission_by_default: bool,
        default_transmission_mode: TransmissionMode,
        default_crc_type: ChecksumType,
    ) -> Self {
        Self {
            entity_id,
            max_file_segment_len: None,
            max_packet_len,
            closure_requested_by_default,
            crc_on_transmission_by_default,
            default_transmission_mode,
            default_crc_type,
            check_timer_interval: Duration::from_secs(5),
            check_limit: 2,
            positive_ack_timer_interval: Duration::from_secs(10),
            positive_ack_timer_expiration_limit: 2,
            immediate_nak_mode: true,
            nak_timer_interval: Duration::from_secs(10),
            nak_timer_expiration_limit: 2,
            disposition_on_cancellation: false,
        }
    }
}

/// Look-up table abstraction for the remote entity configurations of a CFDP entity.
pub trait RemoteConfigStore {
    /// Retrieve the remote entity configuration for the given remote ID.
    fn get(&self, remote_id: u64) -> Option<&RemoteEntityConfig>;
    fn get_mut(&mut self, remote_id: u64) -> Option<&mut RemoteEntityConfig>;
    /// Add a new remote configuration. Returns [true] if the configuration was
    /// inserted successfully, and [false] if a configuration already exists.
    fn add_config(&mut self, cfg: &RemoteEntityConfig) -> bool;
    /// Remove a configuration. Returns [true] if the configuration was removed successfully,
    /// and [false] if no configuration exists for the given remote ID.
    fn remove_config(&mut self, remote_id: u64) -> bool;
}

/// This is a thin wrapper around a [HashMap] to store remote entity configurations.
/// It implements the full [RemoteConfigStore] trait.
#[cfg(feature = "std")]
#[derive(Default, Debug)]
pub struct RemoteConfigStoreStd(pub HashMap<u64, RemoteEntityConfig>);

#[cfg(feature = "std")]
impl RemoteConfigStore for RemoteConfigStoreStd {
    fn get(&self, remote_id: u64) -> Option<&RemoteEntityConfig> {
        self.0.get(&remote_id)
    }
    fn get_mut(&mut self, remote_id: u64) -> Option<&mut RemoteEntityConfig> {
        self.0.get_mut(&remote_id)
    }
    fn add_config(&mut self, cfg: &RemoteEntityConfig) -> bool {
        self.0.insert(cfg.entity_id.value(), *cfg).is_some()
    }
    fn remove_config(&mut self, remote_id: u64) -> bool {
        self.0.remove(&remote_id).is_some()
    }
}

/// This is a thin wrapper around a [alloc::vec::Vec] to store remote entity configurations.
/// It implements the full [RemoteConfigStore] trait.
#[cfg(feature = "alloc")]
#[derive(Default, Debug)]
pub struct RemoteConfigStoreVec(pub alloc::vec::Vec<RemoteEntityConfig>);

#[cfg(feature = "alloc")]
impl RemoteConfigStore for RemoteConfigStoreVec {
    fn get(&self, remote_id: u64) -> Option<&RemoteEntityConfig> {
        self.0
            .iter()
            .find(|&cfg| cfg.entity_id.value() == remote_id)
    }

    fn get_mut(&mut self, remote_id: u64) -> Option<&mut RemoteEntityConfig> {
        self.0
            .iter_mut()
            .find(|cfg| cfg.entity_id.value() == remote_id)
    }

    fn add_config(&mut self, cfg: &RemoteEntityConfig) -> bool {
        self.0.push(*cfg);
        true
    }

    fn remove_config(&mut self, remote_id: u64) -> bool {
        for (idx, cfg) in self.0.iter().enumerate() {
            if cfg.entity_id.value() == remote_id {
                self.0.remove(idx);
                return true;
            }
        }
        false
    }
}

/// A remote entity configuration also implements the [RemoteConfigStore], but the
/// [RemoteConfigStore::add_config] and [RemoteConfigStore::remove_config]
/// are no-ops and always return [false].
impl RemoteConfigStore for RemoteEntityConfig {
    fn get(&self, remote_id: u64) -> Option<&RemoteEntityConfig> {
        if remote_id == self.entity_id.value() {
            return Some(self);
        }
        None
    }

    fn get_mut(&mut self, remote_id: u64) -> Option<&mut RemoteEntityConfig> {
        if remote_id == self.entity_id.value() {
            return Some(self);
        }
        None
    }

    fn add_config(&mut self, _cfg: &RemoteEntityConfig) -> bool {
        false
    }

    fn remove_config(&mut self, _remote_id: u64) -> bool {
        false
    }
}

/// Information passed to the [UserFaultHook] callbacks when a fault handler is invoked.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FaultInfo {
    pub transaction_id: TransactionId,
    pub condition_code: ConditionCode,
    pub progress: u64,
}

impl FaultInfo {
    pub fn new(transaction_id: TransactionId, condition_code: ConditionCode, progress: u64) -> Self {
        Self {
            transaction_id,
            condition_code,
            progress,
        }
    }
}

/// This trait introduces some callbacks which will be called when a particular CFDP fault
/// handler is called.
///
/// It is passed into the CFDP handlers as part of the [FaultHandler] and the local entity
/// configuration and provides a way to specify custom user error handlers. This allows to
/// implement some CFDP features like fault handler logging, which would not be possible
/// generically otherwise.
///
/// For each fault declared by a handler, the callback corresponding to the selected
/// [FaultHandlerCode] will be called.
pub trait UserFaultHook {
    fn notice_of_suspension_cb(&mut self, fault_info: FaultInfo);

    fn notice_of_cancellation_cb(&mut self, fault_info: FaultInfo);

    fn abandoned_cb(&mut self, fault_info: FaultInfo);

    fn ignore_cb(&mut self, fault_info: FaultInfo);
}

/// Dummy fault hook which implements [UserFaultHook] but only provides empty
/// implementations.
#[derive(Default, Debug, PartialEq, Eq, Copy, Clone)]
pub struct DummyFaultHook {}

impl UserFaultHook for DummyFaultHook {
    fn notice_of_suspension_cb(&mut self, _fault_info: FaultInfo) {}

    fn notice_of_cancellation_cb(&mut self, _fault_info: FaultInfo) {}

    fn abandoned_cb(&mut self, _fault_info: FaultInfo) {}

    fn ignore_cb(&mut self, _fault_info: FaultInfo) {}
}

/// This structure is used to implement the fault handling as specified in chapter 4.8 of the CFDP
/// standard.
///
/// It does so by mapping each applicable [spacepackets::cfdp::ConditionCode] to a fault handler
/// which is denoted by the four [spacepackets::cfdp::FaultHandlerCode]s. This code is used
/// to select the error handling inside the CFDP handler itself in addition to dispatching to a
/// user-provided callback function provided by the [UserFaultHook].
///
/// Some notes on the provided default settings:
///
/// - Checksum failures will be ignored by default. This is because for unacknowledged transfers,
///   cancelling the transfer immediately would interfere with the check limit mechanism specified
///   in chapter 4.6.3.3.
/// - Unsupported checksum types will also be ignored by default. Even if the checksum type is
///   not supported the file transfer might still have worked properly.
///
/// For all other faults, the default fault handling operation will be to cancel the transaction.
/// These defaults can be overriden by using the [Self::set_fault_handler] method.
/// Please note that in any case, fault handler overrides can be specified by the sending CFDP
/// entity.
pub struct FaultHandler<UserHandler: UserFaultHook> {
    handler_array: [FaultHandlerCode; 11],
    // Could also change the user fault handler trait to have non mutable methods, but that limits
    // flexbility on the user side..
    pub user_hook: RefCell<UserHandler>,
}

impl<UserHandler: UserFaultHook> FaultHandler<UserHandler> {
    fn condition_code_to_array_index(conditon_code: ConditionCode) -> Option<usize> {
        Some(match conditon_code {
            ConditionCode::PositiveAckLimitReached => 0,
            ConditionCode::KeepAliveLimitReached => 1,
            ConditionCode::InvalidTransmissionMode => 2,
            ConditionCode::FilestoreRejection => 3,
            ConditionCode::FileChecksumFailure => 4,
            ConditionCode::FileSizeError => 5,
            ConditionCode::NakLimitReached => 6,
            ConditionCode::InactivityDetected => 7,
            ConditionCode::InvalidFileStructure => 8,
            ConditionCode::CheckLimitReached => 9,
            ConditionCode::UnsupportedChecksumType => 10,
            _ => return None,
        })
    }

    pub fn set_fault_handler(
        &mut self,
        condition_code: ConditionCode,
        fault_handler: FaultHandlerCode,
    ) {
        let array_idx = Self::condition_code_to_array_index(condition_code);
        if array_idx.is_none() {
            return;
        }
        self.handler_array[array_idx.unwrap()] = fault_handler;
    }

    pub fn new(user_fault_handler: UserHandler) -> Self {
        let mut init_array = [FaultHandlerCode::NoticeOfCancellation; 11];
        init_array
            [Self::condition_code_to_array_index(ConditionCode::FileChecksumFailure).unwrap()] =
            FaultHandlerCode::IgnoreError;
        init_array[Self::condition_code_to_array_index(ConditionCode::UnsupportedChecksumType)
            .unwrap()] = FaultHandlerCode::IgnoreError;
        Self {
            handler_array: init_array,
            user_hook: RefCell::new(user_fault_handler),
        }
    }

    pub fn get_fault_handler(&self, condition_code: ConditionCode) -> FaultHandlerCode {
        let array_idx = Self::condition_code_to_array_index(condition_code);
        if array_idx.is_none() {
            return FaultHandlerCode::IgnoreError;
        }
        self.handler_array[array_idx.unwrap()]
    }

    /// Dispatch the user hook callback corresponding to the given fault handler code.
    pub fn report_fault(&self, fh_code: FaultHandlerCode, fault_info: FaultInfo) {
        let mut handler_mut = self.user_hook.borrow_mut();
        match fh_code {
            FaultHandlerCode::NoticeOfCancellation => {
                handler_mut.notice_of_cancellation_cb(fault_info);
            }
            FaultHandlerCode::NoticeOfSuspension => {
                handler_mut.notice_of_suspension_cb(fault_info);
            }
            FaultHandlerCode::IgnoreError => {
                handler_mut.ignore_cb(fault_info);
            }
            FaultHandlerCode::AbandonTransaction => {
                handler_mut.abandoned_cb(fault_info);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct IndicationConfig {
    pub eof_sent: bool,
    pub eof_recv: bool,
    pub file_segment_recv: bool,
    pub transaction_finished: bool,
    pub suspended: bool,
    pub resumed: bool,
}

impl Default for IndicationConfig {
    fn default() -> Self {
        Self {
            eof_sent: true,
            eof_recv: true,
            file_segment_recv: true,
            transaction_finished: true,
            suspended: true,
            resumed: true,
        }
    }
}

/// Each CFDP entity handler has a [LocalEntityConfig]uration.
pub struct LocalEntityConfig<UserFaultHookInstance: UserFaultHook> {
    pub id: UnsignedByteField,
    pub indication_cfg: IndicationConfig,
    pub fault_handler: FaultHandler<UserFaultHookInstance>,
}

impl<UserFaultHookInstance: UserFaultHook> LocalEntityConfig<UserFaultHookInstance> {
    pub fn new(
        id: UnsignedByteField,
        indication_cfg: IndicationConfig,
        hook: UserFaultHookInstance,
    ) -> Self {
        Self {
            id,
            indication_cfg,
            fault_handler: FaultHandler::new(hook),
        }
    }

    pub fn user_fault_hook_mut(&mut self) -> &mut RefCell<UserFaultHookInstance> {
        &mut self.fault_handler.user_hook
    }

    pub fn user_fault_hook(&self) -> &RefCell<UserFaultHookInstance> {
        &self.fault_handler.user_hook
    }
}

/// The CFDP transaction ID of a CFDP transaction consists of the source entity ID and the
/// sequence number of that transfer which is also determined by the CFDP source entity.
#[derive(Debug, Eq, Copy, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TransactionId {
    source_id: UnsignedByteField,
    seq_num: UnsignedByteField,
}

impl TransactionId {
    pub fn new(source_id: UnsignedByteField, seq_num: UnsignedByteField) -> Self {
        Self { source_id, seq_num }
    }

    pub fn source_id(&self) -> &UnsignedByteField {
        &self.source_id
    }

    pub fn seq_num(&self) -> &UnsignedByteField {
        &self.seq_num
    }
}

impl Hash for TransactionId {
    fn hash<H: core::hash::Hasher>(&self, state: &mut H) {
        self.source_id.value().hash(state);
        self.seq_num.value().hash(state);
    }
}

impl PartialEq for TransactionId {
    fn eq(&self, other: &Self) -> bool {
        self.source_id.value() == other.source_id.value()
            && self.seq_num.value() == other.seq_num.value()
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum State {
    Idle = 0,
    Busy = 1,
    Suspended = 2,
}

/// Parameters of the positive acknowledgement procedures specified in chapter 4.7.1 of the
/// CFDP standard.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PositiveAckParams {
    pub ack_counter: u32,
    /// The positive acknowledgement procedure is active for an EOF (Cancel) PDU. A fault
    /// declared while this flag is set leads to a transaction abandonment, as specified in
    /// chapter 4.11.2.2.3 of the standard.
    pub positive_ack_of_cancellation: bool,
}

/// [crc::Crc] instance using [crc::CRC_32_ISO_HDLC].
///
/// SANA registry entry: <https://sanaregistry.org/r/checksum_identifiers/records/4>,
/// Entry in CRC catalogue: <https://reveng.sourceforge.io/crc-catalogue/all.htm#crc.cat.crc-32>
pub const CRC_32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);
/// [crc::Crc] instance using [crc::CRC_32_ISCSI].
///
/// SANA registry entry: <https://sanaregistry.org/r/checksum_identifiers/records/3>,
/// Entry in CRC catalogue: <https://reveng.sourceforge.io/crc-catalogue/all.htm#crc.cat.crc-32-iscsi>
pub const CRC_32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PacketTarget {
    SourceEntity,
    DestEntity,
}

/// Generic trait which models a raw CFDP packet data unit (PDU) block with some additional
/// context information.
pub trait PduProvider {
    fn pdu_type(&self) -> PduType;
    fn file_directive_type(&self) -> Option<FileDirectiveType>;
    fn raw_pdu(&self) -> &[u8];
    fn packet_target(&self) -> Result<PacketTarget, PduError>;
}

pub struct DummyPduProvider(());

impl PduProvider for DummyPduProvider {
    fn pdu_type(&self) -> PduType {
        PduType::FileData
    }

    fn file_directive_type(&self) -> Option<FileDirectiveType> {
        None
    }

    fn raw_pdu(&self) -> &[u8] {
        &[]
    }

    fn packet_target(&self) -> Result<PacketTarget, PduError> {
        Ok(PacketTarget::SourceEntity)
    }
}

/// This is a helper struct which contains base information about a particular PDU packet.
/// This is also necessary information for CFDP packet routing. For example, some packet types
/// like file data PDUs can only be used by CFDP source entities.
pub struct PduRawWithInfo<'raw_packet> {
    pdu_type: PduType,
    file_directive_type: Option<FileDirectiveType>,
    packet_len: usize,
    raw_packet: &'raw_packet [u8],
}

pub fn determine_packet_target(raw_pdu: &[u8]) -> Result<PacketTarget, PduError> {
    let (header, header_len) = PduHeader::from_bytes(raw_pdu)?;
    if header.pdu_type() == PduType::FileData {
        return Ok(PacketTarget::DestEntity);
    }
    let file_directive_type = FileDirectiveType::try_from(raw_pdu[header_len]).map_err(|_| {
        PduError::InvalidDirectiveType {
            found: raw_pdu[header_len],
            expected: None,
        }
    })?;
    let packet_target =
        match file_directive_type {
            // Section c) of 4.5.3: These PDUs should always be targeted towards the file sender
            // a.k.a. the source handler
            FileDirectiveType::Nak
            | FileDirectiveType::Finished
            | FileDirectiveType::KeepAlive => PacketTarget::SourceEntity,
            // Section b) of 4.5.3: These PDUs should always be targeted towards the file receiver
            // a.k.a. the destination handler
            FileDirectiveType::Metadata
            | FileDirectiveType::Eof
            | FileDirectiveType::Prompt => PacketTarget::DestEntity,
            // Section a): Recipient depends on the type of PDU that is being acknowledged. We can
            // simply extract the PDU type from the raw stream. If it is an EOF PDU, this packet
            // is passed to the source handler, for a Finished PDU, it is passed to the
            // destination handler.
            FileDirectiveType::Ack => {
                let acked_directive = FileDirectiveType::try_from(raw_pdu[header_len + 1])
                    .map_err(|_| PduError::InvalidDirectiveType {
                        found: raw_pdu[header_len],
                        expected: None,
                    })?;
                if acked_directive == FileDirectiveType::Eof {
                    PacketTarget::SourceEntity
                } else if acked_directive == FileDirectiveType::Finished {
                    PacketTarget::DestEntity
                } else {
                    // TODO: Maybe a better error? This might be confusing..
                    return Err(PduError::InvalidDirectiveType {
                        found: raw_pdu[header_len + 1],
                        expected: None,
                    });
                }
            }
        };
    Ok(packet_target)
}

impl<'raw> PduRawWithInfo<'raw> {
    pub fn new(raw_packet: &'raw [u8]) -> Result<Self, PduError> {
        let (pdu_header, header_len) = PduHeader::from_bytes(raw_packet)?;
        if pdu_header.pdu_type() == PduType::FileData {
            return Ok(Self {
                pdu_type: pdu_header.pdu_type(),
                file_directive_type: None,
                packet_len: pdu_header.pdu_len(),
                raw_packet,
            });
        }
        if pdu_header.pdu_datafield_len() < 1 {
            return Err(PduError::Format);
        }
        // Route depending on PDU type and directive type if applicable. Retrieve directive type
        // from the raw stream for better performance (with sanity and directive code check).
        // The routing is based on section 4.5 of the CFDP standard which specifies the PDU
        // forwarding procedure.
        let directive = FileDirectiveType::try_from(raw_packet[header_len]).map_err(|_| {
            PduError::InvalidDirectiveType {
                found: raw_packet[header_len],
                expected: None,
            }
        })?;
        Ok(Self {
            pdu_type: pdu_header.pdu_type(),
            file_directive_type: Some(directive),
            packet_len: pdu_header.pdu_len(),
            raw_packet,
        })
    }
}

impl PduProvider for PduRawWithInfo<'_> {
    fn pdu_type(&self) -> PduType {
        self.pdu_type
    }

    fn file_directive_type(&self) -> Option<FileDirectiveType> {
        self.file_directive_type
    }

    fn raw_pdu(&self) -> &[u8] {
        &self.raw_packet[0..self.packet_len]
    }

    fn packet_target(&self) -> Result<PacketTarget, PduError> {
        determine_packet_target(self.raw_packet)
    }
}

#[cfg(feature = "alloc")]
pub mod alloc_mod {
    use spacepackets::cfdp::{
        pdu::{FileDirectiveType, PduError},
        PduType,
    };

    use crate::{determine_packet_target, PacketTarget, PduProvider, PduRawWithInfo};

    /// Owned variant of a [PduRawWithInfo]. This is also the element type of the outbound
    /// PDU queues of the CFDP handlers.
    #[derive(Debug, PartialEq, Eq, Clone)]
    pub struct PduOwnedWithInfo {
        pub pdu_type: PduType,
        pub file_directive_type: Option<FileDirectiveType>,
        pub pdu: alloc::vec::Vec<u8>,
    }

    impl PduOwnedWithInfo {
        pub fn new_from_raw_packet(raw_packet: &[u8]) -> Result<Self, PduError> {
            Ok(PduRawWithInfo::new(raw_packet)?.into())
        }

        pub fn new(
            pdu_type: PduType,
            file_directive_type: Option<FileDirectiveType>,
            pdu: alloc::vec::Vec<u8>,
        ) -> Self {
            Self {
                pdu_type,
                file_directive_type,
                pdu,
            }
        }
    }

    impl From<PduRawWithInfo<'_>> for PduOwnedWithInfo {
        fn from(value: PduRawWithInfo) -> Self {
            Self::new(
                value.pdu_type(),
                value.file_directive_type(),
                value.raw_pdu().to_vec(),
            )
        }
    }

    impl PduProvider for PduOwnedWithInfo {
        fn pdu_type(&self) -> PduType {
            self.pdu_type
        }

        fn file_directive_type(&self) -> Option<FileDirectiveType> {
            self.file_directive_type
        }

        fn raw_pdu(&self) -> &[u8] {
            &self.pdu
        }

        fn packet_target(&self) -> Result<PacketTarget, PduError> {
            determine_packet_target(&self.pdu)
        }
    }
}
