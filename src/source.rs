//! # CFDP Source Entity Module
//!
//! The [SourceHandler] is the primary component of this module which converts a
//! [ReadablePutRequest] into all packet data units (PDUs) which need to be sent to a remote
//! CFDP entity to perform a File Copy operation to a remote entity.
//!
//! The generated PDUs are placed into an internal queue and are retrieved using the
//! [SourceHandler::get_next_pdu] method to be sent through an arbitrary transport layer. It
//! should be noted that for regular file transfers, each [SourceHandler::state_machine] call
//! will generate one file data PDU. This allows flow control for the user of the state machine.
//!
//! The [SourceHandler::state_machine] will generally perform the following steps after a valid
//! put request was received through the [SourceHandler::put_request] method:
//!
//! 1. Calculate the full file checksum through the virtual filestore.
//! 2. Generate the Metadata PDU to be sent to a remote CFDP entity. You can use the
//!    [spacepackets::cfdp::pdu::metadata::MetadataPduReader] to inspect the generated PDU.
//! 3. Generate all File Data PDUs to be sent to a remote CFDP entity if applicable (file not
//!    empty). The PDU(s) can be inspected using the [spacepackets::cfdp::pdu::file_data::FileDataPdu] reader.
//! 4. Generate an EOF PDU to be sent to a remote CFDP entity. The PDU can be inspected using
//!    the [spacepackets::cfdp::pdu::eof::EofPdu] reader.
//!
//! If this is an unacknowledged transfer with no transaction closure, the file transfer will be
//! done after these steps. In any other case:
//!
//! ### Unacknowledged transfer with requested closure
//!
//! 5. A Finished PDU will be awaited, for example one generated using
//!    [spacepackets::cfdp::pdu::finished::FinishedPduCreator].
//!
//! ### Acknowledged transfer
//!
//! 5. An EOF ACK packet will be awaited, for example one generated using
//!    [spacepackets::cfdp::pdu::ack::AckPdu]. Until the ACK arrives, the EOF PDU is re-sent
//!    each time the positive ACK timer expires. Received NAK PDUs lead to a re-transmission
//!    of the requested file segments.
//! 6. A Finished PDU will be awaited, for example one generated using
//!    [spacepackets::cfdp::pdu::finished::FinishedPduCreator].
//! 7. An ACK packet for the Finished PDU will be generated to be sent to the remote CFDP
//!    entity.
use core::{cell::Cell, cell::RefCell, ops::ControlFlow, str::Utf8Error, time::Duration};

use alloc::collections::VecDeque;

use spacepackets::{
    cfdp::{
        lv::Lv,
        pdu::{
            ack::AckPdu,
            eof::EofPdu,
            file_data::{
                calculate_max_file_seg_len_for_max_packet_len_and_pdu_header,
                FileDataPduCreatorWithReservedDatafield,
            },
            finished::{DeliveryCode, FileStatus, FinishedPduReader},
            metadata::{MetadataGenericParams, MetadataPduCreator},
            nak::NakPduReader,
            CfdpPdu, CommonPduConfig, FileDirectiveType, PduError, PduHeader, WritablePduPacket,
        },
        tlv::EntityIdTlv,
        ChecksumType, ConditionCode, Direction, FaultHandlerCode, LargeFileFlag, PduType,
        SegmentMetadataFlag, SegmentationControl, TransactionStatus, TransmissionMode,
    },
    seq_count::SequenceCounter,
    util::{UnsignedByteField, UnsignedEnum},
};

use crate::{
    segments::{SegmentError, SegmentStore},
    time::Countdown,
    DummyPduProvider, FaultInfo, PduOwnedWithInfo, PduProvider, PositiveAckParams, TimerContext,
    TimerCreator,
};

use super::{
    filestore::{FilestoreError, VirtualFilestore},
    request::{ReadablePutRequest, StaticPutRequestCacher},
    user::{CfdpUser, TransactionFinishedParams},
    LocalEntityConfig, PacketTarget, RemoteConfigStore, RemoteEntityConfig, State, TransactionId,
    UserFaultHook,
};

/// This enumeration models the different transaction steps of the source entity handler.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransactionStep {
    Idle = 0,
    TransactionStart = 1,
    /// Calculation of the whole file checksum before any PDU is generated.
    CrcProcedure = 2,
    SendingMetadata = 3,
    SendingFileData = 4,
    /// Re-transmitting missing packets in acknowledged mode.
    Retransmitting = 5,
    SendingEof = 6,
    WaitingForEofAck = 7,
    WaitingForFinished = 8,
    SendingAckOfFinished = 9,
    NoticeOfCompletion = 10,
}

/// Result of a [SourceHandler::state_machine] call.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FsmResult {
    pub state: State,
    pub step: TransactionStep,
    /// Number of PDUs which are ready to be retrieved with [SourceHandler::get_next_pdu].
    pub num_packets_ready: u32,
}

impl FsmResult {
    pub fn packets_ready(&self) -> bool {
        self.num_packets_ready > 0
    }
}

#[derive(Default, Debug, Copy, Clone)]
pub struct FileParams {
    pub progress: u64,
    pub segment_len: u64,
    pub metadata_only: bool,
    pub file_size: u64,
    /// The checksum is cached to avoid expensive re-calculation when the EOF PDU needs to be
    /// re-sent.
    pub checksum_completed_file: Option<u32>,
}

struct StateHelper {
    step: TransactionStep,
    state: super::State,
    num_packets_ready: Cell<u32>,
}

impl Default for StateHelper {
    fn default() -> Self {
        Self {
            state: super::State::Idle,
            step: TransactionStep::Idle,
            num_packets_ready: Cell::new(0),
        }
    }
}

#[derive(Debug, Copy, Clone)]
pub struct FinishedParams {
    condition_code: ConditionCode,
    delivery_code: DeliveryCode,
    file_status: FileStatus,
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("can not process packet type {pdu_type:?} with directive type {directive_type:?}")]
    CantProcessPacketType {
        pdu_type: PduType,
        directive_type: Option<FileDirectiveType>,
    },
    #[error("unexpected PDU")]
    UnexpectedPdu {
        pdu_type: PduType,
        directive_type: Option<FileDirectiveType>,
    },
    #[error("filestore error: {0}")]
    FilestoreError(#[from] FilestoreError),
    #[error("source file does not have valid UTF8 format: {0}")]
    SourceFileNotValidUtf8(Utf8Error),
    #[error("destination file does not have valid UTF8 format: {0}")]
    DestFileNotValidUtf8(Utf8Error),
    #[error("invalid NAK PDU received")]
    InvalidNakPdu,
    #[error("segment store error: {0}")]
    SegmentStore(#[from] SegmentError),
    #[error("error related to PDU creation: {0}")]
    Pdu(#[from] PduError),
}

#[derive(Debug, thiserror::Error)]
pub enum PutRequestError {
    #[error("error caching put request: {0}")]
    Storage(#[from] spacepackets::ByteConversionError),
    #[error("already busy with put request")]
    AlreadyBusy,
    #[error("no remote entity configuration found for {0:?}")]
    NoRemoteCfgFound(UnsignedByteField),
    #[error("source file does not have valid UTF8 format: {0}")]
    SourceFileNotValidUtf8(#[from] Utf8Error),
    #[error("source file does not exist")]
    FileDoesNotExist,
    #[error("filestore error: {0}")]
    FilestoreError(#[from] FilestoreError),
}

/// Tracker for anomalies which are not protocol errors but are still worth monitoring.
#[derive(Debug, Default, Clone, Copy)]
pub struct AnomalyTracker {
    invalid_ack_directive_code: u8,
}

impl AnomalyTracker {
    pub fn invalid_ack_directive_code(&self) -> u8 {
        self.invalid_ack_directive_code
    }
}

#[derive(Debug)]
struct TransactionParams<CountdownInstance: Countdown> {
    transaction_id: Option<TransactionId>,
    remote_cfg: Option<RemoteEntityConfig>,
    transmission_mode: Option<super::TransmissionMode>,
    closure_requested: bool,
    cond_code_eof: Option<ConditionCode>,
    finished_params: Option<FinishedParams>,
    // File specific transfer fields
    file_params: FileParams,
    // PDU configuration is cached so it can be re-used for all PDUs generated for file transfers.
    pdu_conf: CommonPduConfig,
    check_timer: Option<CountdownInstance>,
    positive_ack_params: Option<PositiveAckParams>,
    ack_timer: Option<CountdownInstance>,
    step_before_retransmission: Option<TransactionStep>,
}

impl<CountdownInstance: Countdown> Default for TransactionParams<CountdownInstance> {
    fn default() -> Self {
        Self {
            transaction_id: Default::default(),
            remote_cfg: Default::default(),
            transmission_mode: Default::default(),
            closure_requested: Default::default(),
            cond_code_eof: Default::default(),
            finished_params: Default::default(),
            file_params: Default::default(),
            pdu_conf: Default::default(),
            check_timer: Default::default(),
            positive_ack_params: Default::default(),
            ack_timer: Default::default(),
            step_before_retransmission: Default::default(),
        }
    }
}

impl<CountdownInstance: Countdown> TransactionParams<CountdownInstance> {
    fn reset(&mut self) {
        *self = Default::default();
    }
}

/// This is the primary CFDP source handler. It models the CFDP source entity, which is
/// primarily responsible for handling put requests to send files to another CFDP destination
/// entity.
///
/// As such, it contains a state machine to perform all operations necessary to perform a
/// source-to-destination file transfer. All generated CFDP PDU packets are queued internally
/// and are retrieved using the [Self::get_next_pdu] method.
///
/// The following core functions are the primary interface:
///
/// 1. [Self::put_request] can be used to start transactions, most notably to start
///    and perform a Copy File procedure to send a file or to only send messages to the user of
///    a remote entity.
/// 2. [Self::state_machine] is the primary interface to execute an
///    active file transfer. It generates the necessary CFDP PDUs for this process.
///    This method is also used to insert received packets with the appropriate destination ID
///    and target handler type into the state machine.
/// 3. [Self::get_next_pdu] retrieves the next packet which should be sent to the remote
///    destination entity of a file copy operation.
///
/// A put request will only be accepted if the handler is in the idle state.
///
/// The handler requires the [alloc] feature but will allocate all required memory on construction
/// time. This means that the handler is still suitable for embedded systems where run-time
/// allocation is prohibited. Furthermore, it uses the [VirtualFilestore] abstraction to allow
/// usage on systems without a [std] filesystem.
/// This handler does not support concurrency out of the box. Instead, if concurrent handling
/// is required, it is recommended to create a new handler and run all active handlers inside a
/// thread pool, or move the newly created handler to a new thread.
pub struct SourceHandler<
    UserFaultHookInstance: UserFaultHook,
    Vfs: VirtualFilestore,
    RemoteConfigStoreInstance: RemoteConfigStore,
    TimerCreatorInstance: TimerCreator<Countdown = CountdownInstance>,
    CountdownInstance: Countdown,
    SequenceCounterInstance: SequenceCounter,
    Segments: SegmentStore,
> {
    local_cfg: LocalEntityConfig<UserFaultHookInstance>,
    pdus_to_be_sent: RefCell<VecDeque<PduOwnedWithInfo>>,
    pdu_and_cksum_buffer: RefCell<alloc::vec::Vec<u8>>,
    put_request_cacher: StaticPutRequestCacher,
    remote_cfg_table: RemoteConfigStoreInstance,
    vfs: Vfs,
    state_helper: StateHelper,
    transaction_params: TransactionParams<CountdownInstance>,
    // Segments which were re-requested by the remote entity and still need to be re-sent.
    retransmission_store: Segments,
    timer_creator: TimerCreatorInstance,
    seq_count_provider: SequenceCounterInstance,
    anomalies: AnomalyTracker,
    cancel_pending: bool,
}

impl<
        UserFaultHookInstance: UserFaultHook,
        Vfs: VirtualFilestore,
        RemoteConfigStoreInstance: RemoteConfigStore,
        TimerCreatorInstance: TimerCreator<Countdown = CountdownInstance>,
        CountdownInstance: Countdown,
        SequenceCounterInstance: SequenceCounter,
        Segments: SegmentStore,
    >
    SourceHandler<
        UserFaultHookInstance,
        Vfs,
        RemoteConfigStoreInstance,
        TimerCreatorInstance,
        CountdownInstance,
        SequenceCounterInstance,
        Segments,
    >
{
    /// Creates a new instance of a source handler.
    ///
    /// # Arguments
    ///
    /// * `cfg` - The local entity configuration for this source handler.
    /// * `vfs` - [VirtualFilestore] implementation used by the handler, which decouples the CFDP
    ///   implementation from the underlying filestore/filesystem. This allows to use this handler
    ///   for embedded systems where a standard runtime might not be available.
    /// * `put_request_cacher` - The put request cacher is used to cache put requests without
    ///   requiring run-time allocation.
    /// * `pdu_and_cksum_buf_size` - The handler requires a buffer to generate PDUs and perform
    ///   checksum calculations. The user can specify the size of this buffer, so this should be
    ///   set to the maximum expected PDU size or a conservative upper bound for this size, for
    ///   example 2048 or 4096 bytes.
    /// * `remote_cfg_table` - The [RemoteConfigStore] used to look up remote
    ///   entities and target specific configuration for file copy operations.
    /// * `timer_creator` - [TimerCreator] used by the CFDP handler to generate
    ///   timers required by various tasks. This allows to use this handler for embedded systems
    ///   where the standard time APIs might not be available.
    /// * `seq_count_provider` - The [SequenceCounter] used to generate the [TransactionId]
    ///   which contains an incrementing counter.
    /// * `retransmission_store` - [SegmentStore] used to track the file segments which were
    ///   re-requested by the remote entity in acknowledged mode.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: LocalEntityConfig<UserFaultHookInstance>,
        vfs: Vfs,
        put_request_cacher: StaticPutRequestCacher,
        pdu_and_cksum_buf_size: usize,
        remote_cfg_table: RemoteConfigStoreInstance,
        timer_creator: TimerCreatorInstance,
        seq_count_provider: SequenceCounterInstance,
        retransmission_store: Segments,
    ) -> Self {
        Self {
            local_cfg: cfg,
            remote_cfg_table,
            pdus_to_be_sent: RefCell::new(VecDeque::new()),
            pdu_and_cksum_buffer: RefCell::new(alloc::vec![0; pdu_and_cksum_buf_size]),
            vfs,
            put_request_cacher,
            state_helper: Default::default(),
            transaction_params: Default::default(),
            retransmission_store,
            anomalies: Default::default(),
            timer_creator,
            seq_count_provider,
            cancel_pending: false,
        }
    }

    /// Calls [Self::state_machine], without inserting a packet.
    pub fn state_machine_no_packet(
        &mut self,
        cfdp_user: &mut impl CfdpUser,
        now: Duration,
    ) -> Result<FsmResult, SourceError> {
        self.state_machine(cfdp_user, now, None::<&DummyPduProvider>)
    }

    /// This is the core function to drive the source handler. It is also used to insert
    /// packets into the source handler.
    ///
    /// The state machine should either be called if a packet with the appropriate destination ID
    /// is received, or periodically in IDLE periods to perform all CFDP related tasks, for
    /// example checking for timeouts or missed file segments.
    ///
    /// The `now` argument is a monotonic timestamp, for example the elapsed time since
    /// application start. It drives all timer related decisions of the handler.
    pub fn state_machine(
        &mut self,
        cfdp_user: &mut impl CfdpUser,
        now: Duration,
        pdu: Option<&impl PduProvider>,
    ) -> Result<FsmResult, SourceError> {
        if let Some(packet) = pdu {
            self.insert_packet(packet)?;
        }
        if self.cancel_pending && self.state() == super::State::Busy {
            self.cancel_pending = false;
            self.notice_of_cancellation(cfdp_user, ConditionCode::CancelRequestReceived, now)?;
        }
        if self.state() == super::State::Busy {
            self.fsm_busy(cfdp_user, now)?;
        }
        Ok(self.fsm_result())
    }

    /// Retrieve the next packet which should be sent to the remote CFDP destination entity.
    pub fn get_next_pdu(&mut self) -> Option<PduOwnedWithInfo> {
        let pdu = self.pdus_to_be_sent.get_mut().pop_front()?;
        self.state_helper
            .num_packets_ready
            .set(self.state_helper.num_packets_ready.get() - 1);
        Some(pdu)
    }

    #[inline]
    pub fn num_packets_ready(&self) -> u32 {
        self.state_helper.num_packets_ready.get()
    }

    #[inline]
    pub fn packets_ready(&self) -> bool {
        self.num_packets_ready() > 0
    }

    #[inline]
    pub fn transaction_id(&self) -> Option<TransactionId> {
        self.transaction_params.transaction_id
    }

    /// Returns the [TransmissionMode] for the active file operation.
    #[inline]
    pub fn transmission_mode(&self) -> Option<super::TransmissionMode> {
        self.transaction_params.transmission_mode
    }

    /// Get the [TransactionStep], which denotes the exact step of a pending CFDP transaction
    /// when applicable.
    #[inline]
    pub fn step(&self) -> TransactionStep {
        self.state_helper.step
    }

    #[inline]
    pub fn state(&self) -> State {
        self.state_helper.state
    }

    /// File copy progress in bytes. Only valid when a transaction is active.
    #[inline]
    pub fn progress(&self) -> u64 {
        self.transaction_params.file_params.progress
    }

    /// Size of the file which is currently transferred. Only valid when a transaction is active.
    #[inline]
    pub fn file_size(&self) -> u64 {
        self.transaction_params.file_params.file_size
    }

    #[inline]
    pub fn local_cfg(&self) -> &LocalEntityConfig<UserFaultHookInstance> {
        &self.local_cfg
    }

    /// Access to the cached fields of the put request of the current transaction.
    #[inline]
    pub fn put_request_cacher(&self) -> &StaticPutRequestCacher {
        &self.put_request_cacher
    }

    #[inline]
    pub fn anomalies(&self) -> &AnomalyTracker {
        &self.anomalies
    }

    /// This function is used to pass a put request to the source handler, which is
    /// also used to start a file copy operation. As such, this function models the Put.request
    /// CFDP primitive.
    ///
    /// Please note that the source handler can only process one put request at a time.
    /// The caller is responsible for creating a new source handler if multiple file copy
    /// operations need to run in parallel.
    pub fn put_request(
        &mut self,
        put_request: &impl ReadablePutRequest,
    ) -> Result<(), PutRequestError> {
        if self.state() != super::State::Idle {
            return Err(PutRequestError::AlreadyBusy);
        }
        self.put_request_cacher.clear();
        self.put_request_cacher.set(put_request)?;
        let remote_cfg = self.remote_cfg_table.get(
            self.put_request_cacher
                .static_fields
                .destination_id
                .value_const(),
        );
        if remote_cfg.is_none() {
            return Err(PutRequestError::NoRemoteCfgFound(
                self.put_request_cacher.static_fields.destination_id,
            ));
        }
        let remote_cfg = remote_cfg.unwrap();
        let transmission_mode = if self.put_request_cacher.static_fields.trans_mode.is_some() {
            self.put_request_cacher.static_fields.trans_mode.unwrap()
        } else {
            remote_cfg.default_transmission_mode
        };
        let closure_requested = if self
            .put_request_cacher
            .static_fields
            .closure_requested
            .is_some()
        {
            self.put_request_cacher
                .static_fields
                .closure_requested
                .unwrap()
        } else {
            remote_cfg.closure_requested_by_default
        };
        if self.put_request_cacher.has_source_file()
            && !self.vfs.exists(self.put_request_cacher.source_file()?)?
        {
            return Err(PutRequestError::FileDoesNotExist);
        }

        let transaction_id = TransactionId::new(
            self.local_cfg.id,
            UnsignedByteField::new(
                SequenceCounterInstance::MAX_BIT_WIDTH / 8,
                self.seq_count_provider.get_and_increment().into(),
            ),
        );
        // Both the source entity and destination entity ID field must have the same size.
        // We use the larger of either the Put Request destination ID or the local entity ID
        // as the size for the new entity IDs.
        let larger_entity_width = core::cmp::max(
            self.local_cfg.id.size(),
            self.put_request_cacher.static_fields.destination_id.size(),
        );
        let create_id = |cached_id: &UnsignedByteField| {
            if larger_entity_width != cached_id.size() {
                UnsignedByteField::new(larger_entity_width, cached_id.value_const())
            } else {
                *cached_id
            }
        };

        // Set PDU configuration fields which are important for generating PDUs.
        self.transaction_params
            .pdu_conf
            .set_source_and_dest_id(
                create_id(&self.local_cfg.id),
                create_id(&self.put_request_cacher.static_fields.destination_id),
            )
            .unwrap();
        // Set up other PDU configuration fields.
        self.transaction_params.pdu_conf.direction = Direction::TowardsReceiver;
        self.transaction_params.pdu_conf.crc_flag =
            remote_cfg.crc_on_transmission_by_default.into();
        self.transaction_params.pdu_conf.transaction_seq_num = *transaction_id.seq_num();
        self.transaction_params.pdu_conf.trans_mode = transmission_mode;
        self.transaction_params.file_params.segment_len =
            self.calculate_max_file_seg_len(remote_cfg);

        self.transaction_params.transaction_id = Some(transaction_id);
        self.transaction_params.remote_cfg = Some(*remote_cfg);
        self.transaction_params.transmission_mode = Some(transmission_mode);
        self.transaction_params.closure_requested = closure_requested;
        self.transaction_params.cond_code_eof = None;
        self.transaction_params.finished_params = None;

        self.state_helper.state = super::State::Busy;
        Ok(())
    }

    /// This function models the Cancel.request CFDP primitive and is the recommended way to
    /// cancel a transaction.
    ///
    /// The cancellation is deferred: it becomes effective at the beginning of the next
    /// [Self::state_machine] call, which will trigger a Notice of Cancellation at this entity
    /// if the passed transaction ID matches the currently active transaction ID. Please note
    /// that the state machine might still be active after that because a cancelled transfer
    /// might still require some packets to be sent to the remote receiver entity.
    ///
    /// This method is idempotent and a no-op if the handler is in the idle state.
    ///
    /// Returns [true] if the cancellation was scheduled and [false] if there is no transaction
    /// active or the passed transaction ID and the active ID do not match.
    pub fn cancel_request(&mut self, transaction_id: &TransactionId) -> bool {
        if self.state() == super::State::Idle {
            return false;
        }
        if let Some(active_id) = self.transaction_id() {
            if active_id == *transaction_id {
                self.cancel_pending = true;
                return true;
            }
        }
        false
    }

    /// This function is public to allow completely resetting the handler, but it is explicitely
    /// discouraged to do this. CFDP has mechanism to detect issues and errors on itself.
    /// Resetting the handler might interfere with these mechanisms and lead to unexpected
    /// behaviour.
    pub fn reset(&mut self) {
        self.state_helper.step = TransactionStep::Idle;
        self.state_helper.state = super::State::Idle;
        self.transaction_params.reset();
        self.retransmission_store.reset();
        self.cancel_pending = false;
        // The PDU queue is not cleared on purpose: packets which were already generated, for
        // example an EOF (Cancel) PDU, still need to be retrieved and sent by the user.
    }

    fn fsm_result(&self) -> FsmResult {
        FsmResult {
            state: self.state(),
            step: self.step(),
            num_packets_ready: self.num_packets_ready(),
        }
    }

    #[inline]
    fn set_step(&mut self, step: TransactionStep) {
        self.state_helper.step = step;
    }

    /// The step against which inserted packets are validated. During re-transmission this is
    /// the step which was active when the NAK PDU arrived.
    fn effective_step(&self) -> TransactionStep {
        if self.step() == TransactionStep::Retransmitting {
            return self
                .transaction_params
                .step_before_retransmission
                .unwrap_or(TransactionStep::Retransmitting);
        }
        self.step()
    }

    fn fsm_busy(
        &mut self,
        user: &mut impl CfdpUser,
        now: Duration,
    ) -> Result<(), SourceError> {
        if self.step() == TransactionStep::Idle {
            self.set_step(TransactionStep::TransactionStart);
        }
        if self.step() == TransactionStep::TransactionStart {
            self.handle_transaction_start(user)?;
            self.set_step(TransactionStep::CrcProcedure);
        }
        if self.step() == TransactionStep::CrcProcedure {
            self.calculate_full_file_checksum()?;
            self.set_step(TransactionStep::SendingMetadata);
        }
        if self.step() == TransactionStep::SendingMetadata {
            self.prepare_and_queue_metadata_pdu()?;
            self.set_step(TransactionStep::SendingFileData);
        }
        if self.step() == TransactionStep::SendingFileData {
            if let ControlFlow::Break(_) = self.file_data_fsm()? {
                // Exit for each file data PDU to allow flow control.
                return Ok(());
            }
        }
        if self.step() == TransactionStep::Retransmitting {
            if let ControlFlow::Break(_) = self.retransmission_fsm()? {
                // Exit for each re-requested segment to allow flow control.
                return Ok(());
            }
        }
        if self.step() == TransactionStep::SendingEof {
            self.eof_fsm(user, now)?;
        }
        if self.step() == TransactionStep::WaitingForEofAck {
            self.handle_positive_ack_procedures(user, now)?;
        }
        if self.step() == TransactionStep::WaitingForFinished {
            self.handle_waiting_for_finished_pdu(user, now)?;
        }
        if self.step() == TransactionStep::SendingAckOfFinished {
            self.set_step(TransactionStep::NoticeOfCompletion);
        }
        if self.step() == TransactionStep::NoticeOfCompletion {
            self.notice_of_completion(user);
            self.reset();
        }
        Ok(())
    }

    fn handle_transaction_start(
        &mut self,
        cfdp_user: &mut impl CfdpUser,
    ) -> Result<(), SourceError> {
        if !self.put_request_cacher.has_source_file() {
            self.transaction_params.file_params.metadata_only = true;
        } else {
            let source_file = self
                .put_request_cacher
                .source_file()
                .map_err(SourceError::SourceFileNotValidUtf8)?;
            if !self.vfs.exists(source_file)? {
                return Err(SourceError::FilestoreError(
                    FilestoreError::FileDoesNotExist,
                ));
            }
            // We expect the destination file path to consist of valid UTF-8 characters as well.
            self.put_request_cacher
                .dest_file()
                .map_err(SourceError::DestFileNotValidUtf8)?;
            self.transaction_params.file_params.file_size = self.vfs.file_size(source_file)?;
            if self.transaction_params.file_params.file_size > u32::MAX as u64 {
                self.transaction_params.pdu_conf.file_flag = LargeFileFlag::Large
            } else {
                self.transaction_params.pdu_conf.file_flag = LargeFileFlag::Normal
            }
        }
        cfdp_user.transaction_indication(&self.transaction_id().unwrap());
        Ok(())
    }

    /// Calculate the checksum of the whole file and cache it for the EOF PDU. This is done
    /// before any PDU is generated, so a re-sent EOF PDU does not require a new calculation.
    /// Empty files still have a checksum, the initial value of the configured algorithm.
    fn calculate_full_file_checksum(&mut self) -> Result<(), SourceError> {
        if self.transaction_params.file_params.metadata_only {
            return Ok(());
        }
        let checksum = self.vfs.calculate_checksum(
            self.put_request_cacher.source_file().unwrap(),
            self.transaction_params
                .remote_cfg
                .as_ref()
                .unwrap()
                .default_crc_type,
            self.transaction_params.file_params.file_size,
            &mut self.pdu_and_cksum_buffer.borrow_mut(),
        )?;
        self.transaction_params.file_params.checksum_completed_file = Some(checksum);
        Ok(())
    }

    fn insert_packet(&mut self, packet_to_insert: &impl PduProvider) -> Result<(), SourceError> {
        if packet_to_insert.packet_target()? != PacketTarget::SourceEntity {
            // Unwrap is okay here, a PacketInfo for a file data PDU should always have the
            // destination as the target.
            return Err(SourceError::CantProcessPacketType {
                pdu_type: packet_to_insert.pdu_type(),
                directive_type: packet_to_insert.file_directive_type(),
            });
        }
        if packet_to_insert.pdu_type() == PduType::FileData {
            // The [PacketInfo] API should ensure that file data PDUs can not be passed
            // into a source entity, so this should never happen.
            return Err(SourceError::UnexpectedPdu {
                pdu_type: PduType::FileData,
                directive_type: None,
            });
        }
        // Unwrap is okay here, the [PacketInfo] API should ensure that the directive type is
        // always a valid value.
        match packet_to_insert
            .file_directive_type()
            .expect("PDU directive type unexpectedly not set")
        {
            FileDirectiveType::Finished => {
                let finished_pdu = FinishedPduReader::new(packet_to_insert.raw_pdu())?;
                self.handle_finished_pdu(&finished_pdu)?;
            }
            FileDirectiveType::Nak => {
                let nak_pdu = NakPduReader::new(packet_to_insert.raw_pdu())?;
                self.handle_nak_pdu(&nak_pdu)?;
            }
            FileDirectiveType::KeepAlive => self.handle_keep_alive_pdu(),
            FileDirectiveType::Ack => {
                let ack_pdu = AckPdu::from_bytes(packet_to_insert.raw_pdu())?;
                self.handle_ack_pdu(&ack_pdu)?;
            }
            FileDirectiveType::Eof
            | FileDirectiveType::Prompt
            | FileDirectiveType::Metadata => {
                return Err(SourceError::CantProcessPacketType {
                    pdu_type: packet_to_insert.pdu_type(),
                    directive_type: packet_to_insert.file_directive_type(),
                });
            }
        }
        Ok(())
    }

    fn file_data_fsm(&mut self) -> Result<ControlFlow<()>, SourceError> {
        if !self.transaction_params.file_params.metadata_only
            && self.transaction_params.file_params.progress
                < self.transaction_params.file_params.file_size
            && self.send_progressing_file_data_pdu()?
        {
            return Ok(ControlFlow::Break(()));
        }
        if self.transaction_params.file_params.metadata_only {
            // Special case: Metadata Only, no EOF required.
            if self.transaction_params.closure_requested {
                self.set_step(TransactionStep::WaitingForFinished);
            } else {
                self.set_step(TransactionStep::NoticeOfCompletion);
            }
        } else {
            // All file data was sent. This also covers the empty file case where an EOF PDU
            // is still required.
            self.transaction_params.cond_code_eof = Some(ConditionCode::NoError);
            self.set_step(TransactionStep::SendingEof);
        }
        Ok(ControlFlow::Continue(()))
    }

    fn retransmission_fsm(&mut self) -> Result<ControlFlow<()>, SourceError> {
        if let Some(segment) = self.retransmission_store.first_segment() {
            let mut missing_chunk_len = segment.1 - segment.0;
            let mut current_offset = segment.0;
            while missing_chunk_len > 0 {
                let chunk_size = core::cmp::min(
                    missing_chunk_len,
                    self.transaction_params.file_params.segment_len,
                );
                self.prepare_and_queue_file_data_pdu(current_offset, chunk_size)?;
                current_offset += chunk_size;
                missing_chunk_len -= chunk_size;
            }
            self.retransmission_store.remove_segment(segment)?;
            return Ok(ControlFlow::Break(()));
        }
        // All re-requested segments were handled, return to the step which was active when the
        // NAK PDU arrived. The EOF PDU is not re-sent.
        let previous_step = self
            .transaction_params
            .step_before_retransmission
            .take()
            .unwrap_or(TransactionStep::WaitingForFinished);
        self.set_step(previous_step);
        Ok(ControlFlow::Continue(()))
    }

    fn eof_fsm(&mut self, user: &mut impl CfdpUser, now: Duration) -> Result<(), SourceError> {
        let checksum = self
            .transaction_params
            .file_params
            .checksum_completed_file
            .unwrap_or(0);
        self.prepare_and_queue_eof_pdu(user, checksum)?;
        if self.transmission_mode().unwrap() == TransmissionMode::Unacknowledged {
            if self.transaction_params.closure_requested {
                self.transaction_params.check_timer = Some(self.timer_creator.create_countdown(
                    TimerContext::CheckLimit {
                        expiry_time: self
                            .transaction_params
                            .remote_cfg
                            .as_ref()
                            .unwrap()
                            .check_timer_interval,
                    },
                    now,
                ));
                self.set_step(TransactionStep::WaitingForFinished);
            } else {
                self.set_step(TransactionStep::NoticeOfCompletion);
            }
        } else {
            self.start_positive_ack_procedure(now);
        }
        Ok(())
    }

    fn start_positive_ack_procedure(&mut self, now: Duration) {
        self.set_step(TransactionStep::WaitingForEofAck);
        match self.transaction_params.positive_ack_params.as_mut() {
            Some(current) => current.ack_counter = 0,
            None => {
                self.transaction_params.positive_ack_params = Some(PositiveAckParams {
                    ack_counter: 0,
                    positive_ack_of_cancellation: false,
                })
            }
        }
        self.transaction_params.ack_timer = Some(self.timer_creator.create_countdown(
            TimerContext::PositiveAck {
                expiry_time: self
                    .transaction_params
                    .remote_cfg
                    .as_ref()
                    .unwrap()
                    .positive_ack_timer_interval,
            },
            now,
        ));
        // The check timer is only used for unacknowledged transfers, ensure at most one timer
        // is armed.
        self.transaction_params.check_timer = None;
    }

    fn handle_positive_ack_procedures(
        &mut self,
        user: &mut impl CfdpUser,
        now: Duration,
    ) -> Result<(), SourceError> {
        let Some(mut positive_ack_params) = self.transaction_params.positive_ack_params else {
            return Ok(());
        };
        if !self
            .transaction_params
            .ack_timer
            .as_ref()
            .unwrap()
            .has_expired(now)
        {
            return Ok(());
        }
        let ack_timer_exp_limit = self
            .transaction_params
            .remote_cfg
            .as_ref()
            .unwrap()
            .positive_ack_timer_expiration_limit;
        if positive_ack_params.ack_counter + 1 >= ack_timer_exp_limit {
            self.declare_fault(user, ConditionCode::PositiveAckLimitReached, now)?;
            if self.state() == super::State::Idle {
                // The transaction was abandoned.
                return Ok(());
            }
            let params = self
                .transaction_params
                .positive_ack_params
                .get_or_insert_with(Default::default);
            params.ack_counter = 0;
            params.positive_ack_of_cancellation = true;
            return Ok(());
        }
        self.transaction_params
            .ack_timer
            .as_mut()
            .unwrap()
            .reset(now);
        positive_ack_params.ack_counter += 1;
        self.transaction_params.positive_ack_params = Some(positive_ack_params);
        let checksum = self
            .transaction_params
            .file_params
            .checksum_completed_file
            .unwrap_or(0);
        self.prepare_and_queue_eof_pdu(user, checksum)?;
        Ok(())
    }

    fn handle_waiting_for_finished_pdu(
        &mut self,
        user: &mut impl CfdpUser,
        now: Duration,
    ) -> Result<(), SourceError> {
        // The check timer is only armed for unacknowledged transfers with requested closure.
        if self.transmission_mode().unwrap() == TransmissionMode::Unacknowledged {
            if let Some(check_timer) = self.transaction_params.check_timer.as_ref() {
                if check_timer.has_expired(now) {
                    self.declare_fault(user, ConditionCode::CheckLimitReached, now)?;
                }
            }
        }
        Ok(())
    }

    fn notice_of_completion(&mut self, cfdp_user: &mut impl CfdpUser) {
        if self.local_cfg.indication_cfg.transaction_finished {
            let finished_params = match self.transaction_params.finished_params {
                Some(finished_params) => TransactionFinishedParams {
                    id: self.transaction_id().unwrap(),
                    condition_code: finished_params.condition_code,
                    delivery_code: finished_params.delivery_code,
                    file_status: finished_params.file_status,
                },
                // This case happens for unacknowledged file copy operations with no closure
                // and for transactions which were cancelled before a Finished PDU arrived.
                None => {
                    let condition_code = self
                        .transaction_params
                        .cond_code_eof
                        .unwrap_or(ConditionCode::NoError);
                    let delivery_code = if condition_code == ConditionCode::NoError {
                        DeliveryCode::Complete
                    } else {
                        DeliveryCode::Incomplete
                    };
                    TransactionFinishedParams {
                        id: self.transaction_id().unwrap(),
                        condition_code,
                        delivery_code,
                        file_status: FileStatus::Unreported,
                    }
                }
            };
            cfdp_user.transaction_finished_indication(&finished_params);
        }
    }

    fn calculate_max_file_seg_len(&self, remote_cfg: &RemoteEntityConfig) -> u64 {
        let mut derived_max_seg_len = calculate_max_file_seg_len_for_max_packet_len_and_pdu_header(
            &PduHeader::new_for_file_directive(self.transaction_params.pdu_conf, 0),
            remote_cfg.max_packet_len,
            None,
        );
        if remote_cfg.max_file_segment_len.is_some() {
            derived_max_seg_len = core::cmp::min(
                remote_cfg.max_file_segment_len.unwrap(),
                derived_max_seg_len,
            );
        }
        derived_max_seg_len as u64
    }

    fn prepare_and_queue_metadata_pdu(&self) -> Result<(), SourceError> {
        if self.transaction_params.file_params.metadata_only {
            let metadata_params = MetadataGenericParams::new(
                self.transaction_params.closure_requested,
                ChecksumType::NullChecksum,
                0,
            );
            let metadata_pdu = MetadataPduCreator::new(
                PduHeader::new_for_file_directive(self.transaction_params.pdu_conf, 0),
                metadata_params,
                Lv::new_empty(),
                Lv::new_empty(),
                self.put_request_cacher.opts_slice(),
            );
            return self.pdu_queue_helper(&metadata_pdu);
        }
        let metadata_params = MetadataGenericParams::new(
            self.transaction_params.closure_requested,
            self.transaction_params
                .remote_cfg
                .as_ref()
                .unwrap()
                .default_crc_type,
            self.transaction_params.file_params.file_size,
        );
        let metadata_pdu = MetadataPduCreator::new(
            PduHeader::new_for_file_directive(self.transaction_params.pdu_conf, 0),
            metadata_params,
            Lv::new_from_str(self.put_request_cacher.source_file().unwrap()).unwrap(),
            Lv::new_from_str(self.put_request_cacher.dest_file().unwrap()).unwrap(),
            self.put_request_cacher.opts_slice(),
        );
        self.pdu_queue_helper(&metadata_pdu)
    }

    fn send_progressing_file_data_pdu(&mut self) -> Result<bool, SourceError> {
        if self.transaction_params.file_params.progress
            >= self.transaction_params.file_params.file_size
        {
            return Ok(false);
        }
        let read_len = self.transaction_params.file_params.segment_len.min(
            self.transaction_params.file_params.file_size
                - self.transaction_params.file_params.progress,
        );
        self.prepare_and_queue_file_data_pdu(
            self.transaction_params.file_params.progress,
            read_len,
        )?;
        Ok(true)
    }

    fn prepare_and_queue_file_data_pdu(
        &mut self,
        offset: u64,
        size: u64,
    ) -> Result<(), SourceError> {
        let seg_ctrl = self
            .put_request_cacher
            .static_fields
            .seg_ctrl
            .unwrap_or(SegmentationControl::NoRecordBoundaryPreservation);
        let pdu_creator = FileDataPduCreatorWithReservedDatafield::new_no_seg_metadata(
            PduHeader::new_for_file_data(
                self.transaction_params.pdu_conf,
                0,
                SegmentMetadataFlag::NotPresent,
                seg_ctrl,
            ),
            offset,
            size,
        );
        let mut unwritten_pdu =
            pdu_creator.write_to_bytes_partially(self.pdu_and_cksum_buffer.get_mut())?;
        self.vfs.read_data(
            self.put_request_cacher.source_file().unwrap(),
            offset,
            size,
            unwritten_pdu.file_data_field_mut(),
        )?;
        let written_len = unwritten_pdu.finish();
        let packet = PduOwnedWithInfo::new(
            PduType::FileData,
            None,
            self.pdu_and_cksum_buffer.get_mut()[0..written_len].to_vec(),
        );
        self.queue_packet(packet);
        // Re-transmitted segments must not disturb the recorded progress high-water mark.
        self.transaction_params.file_params.progress = core::cmp::max(
            self.transaction_params.file_params.progress,
            offset + size,
        );
        Ok(())
    }

    fn prepare_and_queue_eof_pdu(
        &mut self,
        cfdp_user: &mut impl CfdpUser,
        checksum: u32,
    ) -> Result<(), SourceError> {
        let condition_code = self
            .transaction_params
            .cond_code_eof
            .unwrap_or(ConditionCode::NoError);
        // A cancellation EOF must attribute the fault to the cancelling entity.
        let fault_location = if condition_code == ConditionCode::NoError {
            None
        } else {
            Some(EntityIdTlv::new(self.local_cfg.id))
        };
        let eof_pdu = EofPdu::new(
            PduHeader::new_for_file_directive(self.transaction_params.pdu_conf, 0),
            condition_code,
            checksum,
            self.transaction_params.file_params.progress,
            fault_location,
        );
        self.pdu_queue_helper(&eof_pdu)?;
        if self.local_cfg.indication_cfg.eof_sent {
            cfdp_user.eof_sent_indication(&self.transaction_id().unwrap());
        }
        Ok(())
    }

    fn prepare_and_queue_ack_pdu(
        &self,
        condition_code: ConditionCode,
        transaction_status: TransactionStatus,
    ) -> Result<(), SourceError> {
        let ack_pdu = AckPdu::new(
            PduHeader::new_for_file_directive(self.transaction_params.pdu_conf, 0),
            FileDirectiveType::Finished,
            condition_code,
            transaction_status,
        )
        .map_err(PduError::from)?;
        self.pdu_queue_helper(&ack_pdu)?;
        Ok(())
    }

    fn pdu_queue_helper(
        &self,
        pdu: &(impl WritablePduPacket + CfdpPdu),
    ) -> Result<(), SourceError> {
        let mut pdu_buffer_mut = self.pdu_and_cksum_buffer.borrow_mut();
        let written_len = pdu.write_to_bytes(&mut pdu_buffer_mut)?;
        let packet = PduOwnedWithInfo::new(
            pdu.pdu_type(),
            pdu.file_directive_type(),
            pdu_buffer_mut[0..written_len].to_vec(),
        );
        drop(pdu_buffer_mut);
        self.queue_packet(packet);
        Ok(())
    }

    fn queue_packet(&self, packet: PduOwnedWithInfo) {
        self.pdus_to_be_sent.borrow_mut().push_back(packet);
        self.state_helper
            .num_packets_ready
            .set(self.state_helper.num_packets_ready.get() + 1);
    }

    fn handle_finished_pdu(&mut self, finished_pdu: &FinishedPduReader) -> Result<(), SourceError> {
        // Ignore this packet when we are idle.
        if self.state() == State::Idle {
            return Ok(());
        }
        if self.effective_step() != TransactionStep::WaitingForFinished {
            return Err(SourceError::UnexpectedPdu {
                pdu_type: PduType::FileDirective,
                directive_type: Some(FileDirectiveType::Finished),
            });
        }
        // The remote entity has everything it needs, pending re-transmissions are obsolete.
        if self.step() == TransactionStep::Retransmitting {
            self.retransmission_store.reset();
            self.transaction_params.step_before_retransmission = None;
        }
        self.transaction_params.finished_params = Some(FinishedParams {
            condition_code: finished_pdu.condition_code(),
            delivery_code: finished_pdu.delivery_code(),
            file_status: finished_pdu.file_status(),
        });
        if let Some(TransmissionMode::Acknowledged) = self.transmission_mode() {
            self.prepare_and_queue_ack_pdu(
                finished_pdu.condition_code(),
                TransactionStatus::Active,
            )?;
            self.set_step(TransactionStep::SendingAckOfFinished);
        } else {
            self.set_step(TransactionStep::NoticeOfCompletion);
        }
        Ok(())
    }

    fn handle_nak_pdu(&mut self, nak_pdu: &NakPduReader) -> Result<(), SourceError> {
        if self.state() == State::Idle {
            return Ok(());
        }
        if !matches!(
            self.effective_step(),
            TransactionStep::SendingFileData
                | TransactionStep::WaitingForEofAck
                | TransactionStep::WaitingForFinished
        ) {
            return Err(SourceError::UnexpectedPdu {
                pdu_type: PduType::FileDirective,
                directive_type: Some(FileDirectiveType::Nak),
            });
        }
        let mut segments_added = false;
        if let Some(segment_req_iter) = nak_pdu.get_segment_requests_iterator() {
            for segment_req in segment_req_iter {
                // Special case: Metadata PDU is re-requested.
                if segment_req.0 == 0 && segment_req.1 == 0 {
                    self.prepare_and_queue_metadata_pdu()?;
                    continue;
                }
                if (segment_req.1 < segment_req.0)
                    || (segment_req.0 > self.transaction_params.file_params.progress)
                {
                    return Err(SourceError::InvalidNakPdu);
                }
                self.retransmission_store.add_segment(segment_req)?;
                segments_added = true;
            }
        }
        if segments_added && self.step() != TransactionStep::Retransmitting {
            self.transaction_params.step_before_retransmission = Some(self.step());
            self.set_step(TransactionStep::Retransmitting);
        }
        Ok(())
    }

    fn handle_ack_pdu(&mut self, ack_pdu: &AckPdu) -> Result<(), SourceError> {
        if self.effective_step() != TransactionStep::WaitingForEofAck {
            // Drop the packet, wrong state to handle it..
            return Err(SourceError::UnexpectedPdu {
                pdu_type: PduType::FileDirective,
                directive_type: Some(FileDirectiveType::Ack),
            });
        }
        if ack_pdu.directive_code_of_acked_pdu() == FileDirectiveType::Eof {
            // Received the expected ACK, the positive ACK procedure is done.
            self.transaction_params.ack_timer = None;
            self.transaction_params.positive_ack_params = None;
            if self.step() == TransactionStep::Retransmitting {
                self.transaction_params.step_before_retransmission =
                    Some(TransactionStep::WaitingForFinished);
            } else {
                self.set_step(TransactionStep::WaitingForFinished);
            }
        } else {
            self.anomalies.invalid_ack_directive_code =
                self.anomalies.invalid_ack_directive_code.wrapping_add(1);
        }
        Ok(())
    }

    fn notice_of_cancellation(
        &mut self,
        user: &mut impl CfdpUser,
        condition_code: ConditionCode,
        now: Duration,
    ) -> Result<(), SourceError> {
        self.transaction_params.cond_code_eof = Some(condition_code);
        // Pending re-transmissions are obsolete for a cancelled transaction.
        self.retransmission_store.reset();
        self.transaction_params.step_before_retransmission = None;
        if self.transaction_params.file_params.metadata_only {
            self.set_step(TransactionStep::NoticeOfCompletion);
            return Ok(());
        }
        // As specified in 4.11.2.2, prepare an EOF PDU to be sent to the remote entity. Supply
        // the checksum for the file copy progress sent so far.
        let checksum = self.vfs.calculate_checksum(
            self.put_request_cacher.source_file().unwrap(),
            self.transaction_params
                .remote_cfg
                .as_ref()
                .unwrap()
                .default_crc_type,
            self.transaction_params.file_params.progress,
            &mut self.pdu_and_cksum_buffer.borrow_mut(),
        )?;
        // The cached checksum is now the one of the cancellation EOF, which is also the one to
        // use if that EOF PDU needs to be re-sent.
        self.transaction_params.file_params.checksum_completed_file = Some(checksum);
        self.prepare_and_queue_eof_pdu(user, checksum)?;
        if self.transmission_mode().unwrap() == TransmissionMode::Unacknowledged {
            self.set_step(TransactionStep::NoticeOfCompletion);
        } else {
            self.start_positive_ack_procedure(now);
        }
        Ok(())
    }

    pub fn abandon_transaction(&mut self) {
        // I guess an abandoned transaction just stops whatever the handler is doing and resets
        // it to a clean state.. The implementation for this is quite easy.
        self.reset();
    }

    fn declare_fault(
        &mut self,
        user: &mut impl CfdpUser,
        cond: ConditionCode,
        now: Duration,
    ) -> Result<FaultHandlerCode, SourceError> {
        let mut fh_code = self.local_cfg.fault_handler.get_fault_handler(cond);
        // CFDP standard 4.11.2.2.3: Any fault declared in the course of transferring
        // the EOF (cancel) PDU must result in abandonment of the transaction.
        if let Some(positive_ack_params) = self.transaction_params.positive_ack_params {
            if positive_ack_params.positive_ack_of_cancellation {
                fh_code = FaultHandlerCode::AbandonTransaction;
            }
        }
        let fault_info = FaultInfo::new(
            self.transaction_id().unwrap(),
            cond,
            self.transaction_params.file_params.progress,
        );
        match fh_code {
            FaultHandlerCode::NoticeOfCancellation => {
                self.notice_of_cancellation(user, cond, now)?;
            }
            FaultHandlerCode::NoticeOfSuspension => (),
            FaultHandlerCode::IgnoreError => (),
            FaultHandlerCode::AbandonTransaction => {
                self.abandon_transaction();
            }
        }
        self.local_cfg.fault_handler.report_fault(fh_code, fault_info);
        Ok(fh_code)
    }

    fn handle_keep_alive_pdu(&mut self) {}
}

#[cfg(test)]
mod tests {
    use std::{fs::OpenOptions, io::Write, path::PathBuf, string::String, vec::Vec};

    use rand::Rng;
    use spacepackets::{
        cfdp::{
            pdu::{
                ack::AckPdu, file_data::FileDataPdu, finished::FinishedPduCreator,
                metadata::MetadataPduReader, nak::NakPduCreator,
            },
            CrcFlag,
        },
        seq_count::SequenceCounterSimple,
        util::UnsignedByteFieldU16,
    };
    use tempfile::TempPath;

    use super::*;
    use crate::{
        filestore::NativeFilestore,
        request::PutRequestOwned,
        segments::SegmentList,
        tests::{basic_remote_cfg_table, TestCfdpUser, TestFaultHandler},
        time::MonotonicCountdown,
        FaultHandler, IndicationConfig, MonotonicTimerCreator, PduRawWithInfo,
        RemoteConfigStoreStd, CRC_32,
    };

    const LOCAL_ID: UnsignedByteFieldU16 = UnsignedByteFieldU16::new(1);
    const REMOTE_ID: UnsignedByteFieldU16 = UnsignedByteFieldU16::new(2);
    const INVALID_ID: UnsignedByteFieldU16 = UnsignedByteFieldU16::new(5);

    // Expiry periods of the default remote entity configuration.
    const POSITIVE_ACK_TIMER_INTERVAL: Duration = Duration::from_secs(10);
    const CHECK_TIMER_INTERVAL: Duration = Duration::from_secs(5);

    fn init_full_filepaths_textfile() -> (TempPath, PathBuf) {
        (
            tempfile::NamedTempFile::new().unwrap().into_temp_path(),
            tempfile::TempPath::from_path("/tmp/test.txt").to_path_buf(),
        )
    }

    type TestSourceHandler = SourceHandler<
        TestFaultHandler,
        NativeFilestore,
        RemoteConfigStoreStd,
        MonotonicTimerCreator,
        MonotonicCountdown,
        SequenceCounterSimple<u16>,
        SegmentList,
    >;

    struct SourceHandlerTestbench {
        handler: TestSourceHandler,
        current_time: Duration,
        transmission_mode: TransmissionMode,
        #[allow(dead_code)]
        srcfile_handle: TempPath,
        srcfile: String,
        destfile: String,
        max_packet_len: usize,
        check_idle_on_drop: bool,
    }

    #[allow(dead_code)]
    struct TransferInfo {
        id: TransactionId,
        file_size: u64,
        closure_requested: bool,
        pdu_header: PduHeader,
    }

    #[derive(Debug, Clone, Copy)]
    struct EofParams {
        file_size: u64,
        file_checksum: u32,
        condition_code: ConditionCode,
    }

    impl EofParams {
        pub const fn new_success(file_size: u64, file_checksum: u32) -> Self {
            Self {
                file_size,
                file_checksum,
                condition_code: ConditionCode::NoError,
            }
        }
    }

    impl SourceHandlerTestbench {
        fn new(
            transmission_mode: TransmissionMode,
            crc_on_transmission_by_default: bool,
            max_packet_len: usize,
        ) -> Self {
            let local_entity_cfg = LocalEntityConfig {
                id: LOCAL_ID.into(),
                indication_cfg: IndicationConfig::default(),
                fault_handler: FaultHandler::new(TestFaultHandler::default()),
            };
            let static_put_request_cacher = StaticPutRequestCacher::new(2048);
            let (srcfile_handle, destfile) = init_full_filepaths_textfile();
            let srcfile = String::from(srcfile_handle.to_path_buf().to_str().unwrap());
            Self {
                handler: SourceHandler::new(
                    local_entity_cfg,
                    NativeFilestore::default(),
                    static_put_request_cacher,
                    1024,
                    basic_remote_cfg_table(
                        REMOTE_ID,
                        max_packet_len,
                        crc_on_transmission_by_default,
                    ),
                    MonotonicTimerCreator::default(),
                    SequenceCounterSimple::default(),
                    SegmentList::default(),
                ),
                current_time: Duration::ZERO,
                transmission_mode,
                srcfile_handle,
                srcfile,
                destfile: String::from(destfile.to_path_buf().to_str().unwrap()),
                max_packet_len,
                check_idle_on_drop: true,
            }
        }

        fn create_user(&self, next_expected_seq_num: u64, filesize: u64) -> TestCfdpUser {
            TestCfdpUser::new(
                next_expected_seq_num,
                self.srcfile.clone(),
                self.destfile.clone(),
                filesize,
            )
        }

        fn put_request(
            &mut self,
            put_request: &impl ReadablePutRequest,
        ) -> Result<(), PutRequestError> {
            self.handler.put_request(put_request)
        }

        fn state_machine(&mut self, cfdp_user: &mut TestCfdpUser) -> FsmResult {
            self.handler
                .state_machine_no_packet(cfdp_user, self.current_time)
                .expect("source handler FSM failure")
        }

        fn insert_packet(&mut self, cfdp_user: &mut TestCfdpUser, raw_pdu: &[u8]) -> FsmResult {
            let packet_info = PduRawWithInfo::new(raw_pdu).unwrap();
            self.handler
                .state_machine(cfdp_user, self.current_time, Some(&packet_info))
                .expect("source handler FSM failure")
        }

        fn expire_positive_ack_timer(&mut self) {
            self.current_time += POSITIVE_ACK_TIMER_INTERVAL + Duration::from_millis(1);
        }

        fn expire_check_timer(&mut self) {
            self.current_time += CHECK_TIMER_INTERVAL + Duration::from_millis(1);
        }

        fn all_fault_queues_empty(&self) -> bool {
            self.handler
                .local_cfg
                .user_fault_hook()
                .borrow()
                .all_queues_empty()
        }

        fn test_fault_handler_mut(&mut self) -> &mut core::cell::RefCell<TestFaultHandler> {
            self.handler.local_cfg.user_fault_hook_mut()
        }

        fn pdu_queue_empty(&self) -> bool {
            !self.handler.packets_ready()
        }

        fn get_next_sent_pdu(&mut self) -> Option<PduOwnedWithInfo> {
            self.handler.get_next_pdu()
        }

        fn common_pdu_check_for_file_transfer(&self, pdu_header: &PduHeader, crc_flag: CrcFlag) {
            assert_eq!(
                pdu_header.seg_ctrl(),
                SegmentationControl::NoRecordBoundaryPreservation
            );
            assert_eq!(
                pdu_header.seg_metadata_flag(),
                SegmentMetadataFlag::NotPresent
            );
            assert_eq!(pdu_header.common_pdu_conf().source_id(), LOCAL_ID.into());
            assert_eq!(pdu_header.common_pdu_conf().dest_id(), REMOTE_ID.into());
            assert_eq!(pdu_header.common_pdu_conf().crc_flag, crc_flag);
            assert_eq!(
                pdu_header.common_pdu_conf().trans_mode,
                self.transmission_mode
            );
            assert_eq!(
                pdu_header.common_pdu_conf().direction,
                Direction::TowardsReceiver
            );
            assert_eq!(
                pdu_header.common_pdu_conf().file_flag,
                LargeFileFlag::Normal
            );
            assert_eq!(pdu_header.common_pdu_conf().transaction_seq_num.size(), 2);
        }

        fn nak_for_file_segments(
            &mut self,
            cfdp_user: &mut TestCfdpUser,
            transfer_info: &TransferInfo,
            seg_reqs: &[(u32, u32)],
        ) -> FsmResult {
            let nak_pdu = NakPduCreator::new_normal_file_size(
                transfer_info.pdu_header,
                0,
                transfer_info.file_size as u32,
                seg_reqs,
            )
            .unwrap();
            let nak_pdu_vec = nak_pdu.to_vec().unwrap();
            self.insert_packet(cfdp_user, &nak_pdu_vec)
        }

        // Keep calling the state machine until all re-requested segments were processed.
        fn drain_retransmissions(&mut self, cfdp_user: &mut TestCfdpUser) {
            while self.handler.step() == TransactionStep::Retransmitting {
                self.state_machine(cfdp_user);
            }
        }

        fn generic_file_transfer(
            &mut self,
            cfdp_user: &mut TestCfdpUser,
            with_closure: bool,
            file_data: Vec<u8>,
        ) -> (TransferInfo, u32) {
            let mut digest = CRC_32.digest();
            digest.update(&file_data);
            let checksum = digest.finalize();
            cfdp_user.expected_full_src_name = self.srcfile.clone();
            cfdp_user.expected_full_dest_name = self.destfile.clone();
            cfdp_user.expected_file_size = file_data.len() as u64;
            let put_request = PutRequestOwned::new_regular_request(
                REMOTE_ID.into(),
                &self.srcfile,
                &self.destfile,
                Some(self.transmission_mode),
                Some(with_closure),
            )
            .expect("creating put request failed");
            let transaction_info = self.common_file_transfer_init_with_metadata_check(
                cfdp_user,
                put_request,
                cfdp_user.expected_file_size,
            );
            let mut current_offset = 0;
            let chunks = file_data.chunks(
                calculate_max_file_seg_len_for_max_packet_len_and_pdu_header(
                    &transaction_info.pdu_header,
                    self.max_packet_len,
                    None,
                ),
            );
            let mut fd_pdus = 0;
            for segment in chunks {
                self.check_next_file_pdu(current_offset, segment);
                self.state_machine(cfdp_user);
                fd_pdus += 1;
                current_offset += segment.len() as u64;
            }
            self.common_eof_pdu_check(
                cfdp_user,
                transaction_info.closure_requested,
                EofParams {
                    file_size: cfdp_user.expected_file_size,
                    file_checksum: checksum,
                    condition_code: ConditionCode::NoError,
                },
                1,
            );
            (transaction_info, fd_pdus)
        }

        fn common_file_transfer_init_with_metadata_check(
            &mut self,
            cfdp_user: &mut TestCfdpUser,
            put_request: PutRequestOwned,
            file_size: u64,
        ) -> TransferInfo {
            assert_eq!(cfdp_user.transaction_indication_call_count, 0);
            assert_eq!(cfdp_user.eof_sent_call_count, 0);

            self.put_request(&put_request)
                .expect("put_request call failed");
            assert_eq!(self.handler.state(), State::Busy);
            assert_eq!(self.handler.step(), TransactionStep::Idle);
            let transaction_id = self.handler.transaction_id().unwrap();
            let fsm_result = self.state_machine(cfdp_user);
            assert_eq!(fsm_result.num_packets_ready, 2);
            assert!(fsm_result.packets_ready());
            let next_pdu = self.get_next_sent_pdu().unwrap();
            assert!(!self.pdu_queue_empty());
            let metadata_pdu_reader = self.metadata_check(&next_pdu, file_size);
            let closure_requested = if let Some(closure_requested) = put_request.closure_requested {
                assert_eq!(
                    metadata_pdu_reader.metadata_params().closure_requested,
                    closure_requested
                );
                closure_requested
            } else {
                assert!(metadata_pdu_reader.metadata_params().closure_requested);
                metadata_pdu_reader.metadata_params().closure_requested
            };
            TransferInfo {
                pdu_header: *metadata_pdu_reader.pdu_header(),
                closure_requested,
                file_size,
                id: transaction_id,
            }
        }

        fn metadata_check<'a>(
            &self,
            next_pdu: &'a PduOwnedWithInfo,
            file_size: u64,
        ) -> MetadataPduReader<'a> {
            assert_eq!(next_pdu.pdu_type, PduType::FileDirective);
            assert_eq!(
                next_pdu.file_directive_type,
                Some(FileDirectiveType::Metadata)
            );
            let metadata_pdu =
                MetadataPduReader::new(next_pdu.raw_pdu()).expect("invalid metadata PDU format");
            self.common_pdu_check_for_file_transfer(metadata_pdu.pdu_header(), CrcFlag::NoCrc);
            assert_eq!(
                metadata_pdu
                    .src_file_name()
                    .value_as_str()
                    .unwrap()
                    .unwrap(),
                self.srcfile
            );
            assert_eq!(
                metadata_pdu
                    .dest_file_name()
                    .value_as_str()
                    .unwrap()
                    .unwrap(),
                self.destfile
            );
            assert_eq!(metadata_pdu.metadata_params().file_size, file_size);
            assert_eq!(
                metadata_pdu.metadata_params().checksum_type,
                ChecksumType::Crc32
            );
            assert_eq!(metadata_pdu.transmission_mode(), self.transmission_mode);
            assert_eq!(metadata_pdu.options(), &[]);
            metadata_pdu
        }

        fn check_next_file_pdu(&mut self, expected_offset: u64, expected_data: &[u8]) {
            let next_pdu = self.get_next_sent_pdu().unwrap();
            assert_eq!(next_pdu.pdu_type, PduType::FileData);
            assert!(next_pdu.file_directive_type.is_none());
            let fd_pdu =
                FileDataPdu::from_bytes(next_pdu.raw_pdu()).expect("reading file data PDU failed");
            assert_eq!(fd_pdu.offset(), expected_offset);
            assert_eq!(fd_pdu.file_data(), expected_data);
            assert!(fd_pdu.segment_metadata().is_none());
        }

        fn acknowledge_eof_pdu(
            &mut self,
            cfdp_user: &mut TestCfdpUser,
            transaction_info: &TransferInfo,
        ) {
            let ack_pdu = AckPdu::new(
                transaction_info.pdu_header,
                FileDirectiveType::Eof,
                ConditionCode::NoError,
                TransactionStatus::Active,
            )
            .expect("creating ACK PDU failed");
            let ack_pdu_vec = ack_pdu.to_vec().unwrap();
            self.insert_packet(cfdp_user, &ack_pdu_vec);
        }

        fn common_finished_pdu_ack_check(&mut self) {
            assert!(!self.pdu_queue_empty());
            let next_pdu = self.get_next_sent_pdu().unwrap();
            assert!(self.pdu_queue_empty());
            assert_eq!(next_pdu.pdu_type, PduType::FileDirective);
            assert_eq!(
                next_pdu.file_directive_type,
                Some(FileDirectiveType::Ack)
            );
            let ack_pdu = AckPdu::from_bytes(next_pdu.raw_pdu()).unwrap();
            self.common_pdu_check_for_file_transfer(ack_pdu.pdu_header(), CrcFlag::NoCrc);
            assert_eq!(ack_pdu.condition_code(), ConditionCode::NoError);
            assert_eq!(
                ack_pdu.directive_code_of_acked_pdu(),
                FileDirectiveType::Finished
            );
            assert_eq!(ack_pdu.transaction_status(), TransactionStatus::Active);
        }

        fn common_eof_pdu_check(
            &mut self,
            cfdp_user: &mut TestCfdpUser,
            closure_requested: bool,
            eof_params: EofParams,
            eof_sent_call_count: u32,
        ) {
            let next_pdu = self.get_next_sent_pdu().unwrap();
            assert_eq!(next_pdu.pdu_type, PduType::FileDirective);
            assert_eq!(
                next_pdu.file_directive_type,
                Some(FileDirectiveType::Eof)
            );
            let eof_pdu = EofPdu::from_bytes(next_pdu.raw_pdu()).expect("invalid EOF PDU format");
            self.common_pdu_check_for_file_transfer(eof_pdu.pdu_header(), CrcFlag::NoCrc);
            assert_eq!(eof_pdu.condition_code(), eof_params.condition_code);
            assert_eq!(eof_pdu.file_size(), eof_params.file_size);
            assert_eq!(eof_pdu.file_checksum(), eof_params.file_checksum);
            assert_eq!(
                eof_pdu
                    .pdu_header()
                    .common_pdu_conf()
                    .transaction_seq_num
                    .value_const(),
                0
            );
            if self.transmission_mode == TransmissionMode::Unacknowledged {
                if !closure_requested {
                    assert_eq!(self.handler.state(), State::Idle);
                    assert_eq!(self.handler.step(), TransactionStep::Idle);
                } else {
                    assert_eq!(self.handler.state(), State::Busy);
                    assert_eq!(self.handler.step(), TransactionStep::WaitingForFinished);
                }
            } else {
                assert_eq!(self.handler.state(), State::Busy);
                assert_eq!(self.handler.step(), TransactionStep::WaitingForEofAck);
            }

            assert_eq!(cfdp_user.transaction_indication_call_count, 1);
            assert_eq!(cfdp_user.eof_sent_call_count, eof_sent_call_count);
            self.all_fault_queues_empty();
        }

        fn common_tiny_file_transfer(
            &mut self,
            cfdp_user: &mut TestCfdpUser,
            with_closure: bool,
        ) -> (&'static str, TransferInfo) {
            let mut file = OpenOptions::new()
                .write(true)
                .open(&self.srcfile)
                .expect("opening file failed");
            let content_str = "Hello World!";
            file.write_all(content_str.as_bytes())
                .expect("writing file content failed");
            drop(file);
            let (transfer_info, fd_pdus) = self.generic_file_transfer(
                cfdp_user,
                with_closure,
                content_str.as_bytes().to_vec(),
            );
            assert_eq!(fd_pdus, 1);
            (content_str, transfer_info)
        }

        // Finish handling: Simulate completion from the destination side by inserting the
        // Finished PDU.
        fn finish_handling(&mut self, user: &mut TestCfdpUser, transfer_info: &TransferInfo) {
            let finished_pdu = FinishedPduCreator::new_no_error(
                transfer_info.pdu_header,
                DeliveryCode::Complete,
                FileStatus::Retained,
            );
            let finished_pdu_vec = finished_pdu.to_vec().unwrap();
            self.insert_packet(user, &finished_pdu_vec);
        }
    }

    impl Drop for SourceHandlerTestbench {
        fn drop(&mut self) {
            self.all_fault_queues_empty();
            if self.check_idle_on_drop {
                assert_eq!(self.handler.state(), State::Idle);
                assert_eq!(self.handler.step(), TransactionStep::Idle);
            }
        }
    }

    #[test]
    fn test_basic() {
        let tb = SourceHandlerTestbench::new(TransmissionMode::Unacknowledged, false, 512);
        assert!(tb.handler.transmission_mode().is_none());
        assert!(tb.pdu_queue_empty());
        assert_eq!(tb.handler.num_packets_ready(), 0);
        assert_eq!(tb.handler.anomalies().invalid_ack_directive_code(), 0);
    }

    #[test]
    fn test_empty_file_transfer_not_acked_no_closure() {
        let mut tb = SourceHandlerTestbench::new(TransmissionMode::Unacknowledged, false, 512);
        let file_size = 0;
        let put_request = PutRequestOwned::new_regular_request(
            REMOTE_ID.into(),
            &tb.srcfile,
            &tb.destfile,
            Some(TransmissionMode::Unacknowledged),
            Some(false),
        )
        .expect("creating put request failed");
        let mut user = tb.create_user(0, file_size);
        let transfer_info =
            tb.common_file_transfer_init_with_metadata_check(&mut user, put_request, file_size);
        tb.common_eof_pdu_check(
            &mut user,
            transfer_info.closure_requested,
            EofParams::new_success(file_size, CRC_32.digest().finalize()),
            1,
        );
        user.verify_finished_indication(
            DeliveryCode::Complete,
            ConditionCode::NoError,
            transfer_info.id,
            FileStatus::Unreported,
        );
    }

    #[test]
    fn test_empty_file_transfer_acked() {
        let mut tb = SourceHandlerTestbench::new(TransmissionMode::Acknowledged, false, 512);
        let file_size = 0;
        let put_request = PutRequestOwned::new_regular_request(
            REMOTE_ID.into(),
            &tb.srcfile,
            &tb.destfile,
            Some(TransmissionMode::Acknowledged),
            Some(false),
        )
        .expect("creating put request failed");
        let mut user = tb.create_user(0, file_size);
        let transaction_info =
            tb.common_file_transfer_init_with_metadata_check(&mut user, put_request, file_size);
        tb.common_eof_pdu_check(
            &mut user,
            transaction_info.closure_requested,
            EofParams::new_success(file_size, CRC_32.digest().finalize()),
            1,
        );

        tb.acknowledge_eof_pdu(&mut user, &transaction_info);
        tb.finish_handling(&mut user, &transaction_info);
        tb.common_finished_pdu_ack_check();
        user.verify_finished_indication_retained(
            DeliveryCode::Complete,
            ConditionCode::NoError,
            transaction_info.id,
        );
    }

    #[test]
    fn test_tiny_file_transfer_not_acked_no_closure() {
        let mut user = TestCfdpUser::default();
        let mut tb = SourceHandlerTestbench::new(TransmissionMode::Unacknowledged, false, 512);
        tb.common_tiny_file_transfer(&mut user, false);
    }

    #[test]
    fn test_tiny_file_transfer_acked() {
        let mut user = TestCfdpUser::default();
        let mut tb = SourceHandlerTestbench::new(TransmissionMode::Acknowledged, false, 512);
        let (_data, transfer_info) = tb.common_tiny_file_transfer(&mut user, false);
        tb.acknowledge_eof_pdu(&mut user, &transfer_info);
        tb.finish_handling(&mut user, &transfer_info);
        tb.common_finished_pdu_ack_check();
        assert_eq!(tb.handler.anomalies().invalid_ack_directive_code(), 0);
    }

    #[test]
    fn test_tiny_file_transfer_not_acked_with_closure() {
        let mut tb = SourceHandlerTestbench::new(TransmissionMode::Unacknowledged, false, 512);
        let mut user = TestCfdpUser::default();
        let (_data, transfer_info) = tb.common_tiny_file_transfer(&mut user, true);
        tb.finish_handling(&mut user, &transfer_info)
    }

    #[test]
    fn test_two_segment_file_transfer_not_acked_no_closure() {
        let mut tb = SourceHandlerTestbench::new(TransmissionMode::Unacknowledged, false, 128);
        let mut user = TestCfdpUser::default();
        let mut file = OpenOptions::new()
            .write(true)
            .open(&tb.srcfile)
            .expect("opening file failed");
        let mut rand_data = [0u8; 140];
        rand::rng().fill(&mut rand_data[..]);
        file.write_all(&rand_data)
            .expect("writing file content failed");
        drop(file);
        let (_, fd_pdus) = tb.generic_file_transfer(&mut user, false, rand_data.to_vec());
        assert_eq!(fd_pdus, 2);
    }

    #[test]
    fn test_two_segment_file_transfer_not_acked_with_closure() {
        let mut tb = SourceHandlerTestbench::new(TransmissionMode::Unacknowledged, false, 128);
        let mut user = TestCfdpUser::default();
        let mut file = OpenOptions::new()
            .write(true)
            .open(&tb.srcfile)
            .expect("opening file failed");
        let mut rand_data = [0u8; 140];
        rand::rng().fill(&mut rand_data[..]);
        file.write_all(&rand_data)
            .expect("writing file content failed");
        drop(file);
        let (transfer_info, fd_pdus) =
            tb.generic_file_transfer(&mut user, true, rand_data.to_vec());
        assert_eq!(fd_pdus, 2);
        tb.finish_handling(&mut user, &transfer_info)
    }

    #[test]
    fn test_two_segment_file_transfer_acked() {
        let mut user = TestCfdpUser::default();
        let mut tb = SourceHandlerTestbench::new(TransmissionMode::Acknowledged, false, 128);
        let mut file = OpenOptions::new()
            .write(true)
            .open(&tb.srcfile)
            .expect("opening file failed");
        let mut rand_data = [0u8; 140];
        rand::rng().fill(&mut rand_data[..]);
        file.write_all(&rand_data)
            .expect("writing file content failed");
        drop(file);
        let (transfer_info, fd_pdus) =
            tb.generic_file_transfer(&mut user, true, rand_data.to_vec());
        assert_eq!(fd_pdus, 2);
        tb.acknowledge_eof_pdu(&mut user, &transfer_info);
        tb.finish_handling(&mut user, &transfer_info);
        tb.common_finished_pdu_ack_check();
    }

    #[test]
    fn test_multi_segment_file_transfer_strictly_increasing_offsets() {
        let mut tb = SourceHandlerTestbench::new(TransmissionMode::Unacknowledged, false, 64);
        let mut user = TestCfdpUser::default();
        let mut file = OpenOptions::new()
            .write(true)
            .open(&tb.srcfile)
            .expect("opening file failed");
        let mut rand_data = [0u8; 1200];
        rand::rng().fill(&mut rand_data[..]);
        file.write_all(&rand_data)
            .expect("writing file content failed");
        drop(file);
        // The offset and content checks are performed segment for segment by the generic
        // transfer helper.
        let (_, fd_pdus) = tb.generic_file_transfer(&mut user, false, rand_data.to_vec());
        assert!(fd_pdus > 10);
    }

    #[test]
    fn test_put_request_no_remote_cfg() {
        let mut tb = SourceHandlerTestbench::new(TransmissionMode::Unacknowledged, false, 512);

        let (srcfile, destfile) = init_full_filepaths_textfile();
        let srcfile_str = String::from(srcfile.to_str().unwrap());
        let destfile_str = String::from(destfile.to_str().unwrap());
        let put_request = PutRequestOwned::new_regular_request(
            INVALID_ID.into(),
            &srcfile_str,
            &destfile_str,
            Some(TransmissionMode::Unacknowledged),
            Some(true),
        )
        .expect("creating put request failed");
        let error = tb.handler.put_request(&put_request);
        assert!(error.is_err());
        let error = error.unwrap_err();
        if let PutRequestError::NoRemoteCfgFound(id) = error {
            assert_eq!(id, INVALID_ID.into());
        } else {
            panic!("unexpected error type: {:?}", error);
        }
    }

    #[test]
    fn test_put_request_file_does_not_exist() {
        let mut tb = SourceHandlerTestbench::new(TransmissionMode::Unacknowledged, false, 512);

        let file_which_does_not_exist = "/tmp/this_file_does_not_exist.txt";
        let destfile = "/tmp/tmp.txt";
        let put_request = PutRequestOwned::new_regular_request(
            REMOTE_ID.into(),
            file_which_does_not_exist,
            destfile,
            Some(TransmissionMode::Unacknowledged),
            Some(true),
        )
        .expect("creating put request failed");
        let error = tb.put_request(&put_request);
        assert!(error.is_err());
        let error = error.unwrap_err();
        if !matches!(error, PutRequestError::FileDoesNotExist) {
            panic!("unexpected error type: {:?}", error);
        }
    }

    #[test]
    fn test_put_request_while_busy() {
        let mut tb = SourceHandlerTestbench::new(TransmissionMode::Unacknowledged, false, 512);
        tb.check_idle_on_drop = false;
        let put_request = PutRequestOwned::new_regular_request(
            REMOTE_ID.into(),
            &tb.srcfile,
            &tb.destfile,
            Some(TransmissionMode::Unacknowledged),
            Some(true),
        )
        .expect("creating put request failed");
        tb.put_request(&put_request).unwrap();
        let error = tb.put_request(&put_request);
        assert!(error.is_err());
        if !matches!(error.unwrap_err(), PutRequestError::AlreadyBusy) {
            panic!("unexpected error type");
        }
    }

    #[test]
    fn test_cancel_request_on_idle_handler_is_no_op() {
        let mut tb = SourceHandlerTestbench::new(TransmissionMode::Unacknowledged, false, 512);
        let id = TransactionId::new(LOCAL_ID.into(), UnsignedByteFieldU16::new(0).into());
        assert!(!tb.handler.cancel_request(&id));
        assert!(!tb.handler.cancel_request(&id));
        assert_eq!(tb.handler.state(), State::Idle);
    }

    #[test]
    fn test_finished_pdu_check_timeout() {
        let mut tb = SourceHandlerTestbench::new(TransmissionMode::Unacknowledged, false, 512);
        let file_size = 0;
        let put_request = PutRequestOwned::new_regular_request(
            REMOTE_ID.into(),
            &tb.srcfile,
            &tb.destfile,
            Some(TransmissionMode::Unacknowledged),
            Some(true),
        )
        .expect("creating put request failed");
        let mut user = tb.create_user(0, file_size);
        let transaction_info =
            tb.common_file_transfer_init_with_metadata_check(&mut user, put_request, file_size);
        let expected_id = tb.handler.transaction_id().unwrap();
        tb.common_eof_pdu_check(
            &mut user,
            transaction_info.closure_requested,
            EofParams::new_success(file_size, CRC_32.digest().finalize()),
            1,
        );
        assert!(tb.pdu_queue_empty());

        // Enforce a check limit error by expiring the check limit timer -> leads to a notice of
        // cancellation -> leads to an EOF PDU with the appropriate error code.
        tb.expire_check_timer();

        let fsm_result = tb.state_machine(&mut user);
        assert_eq!(fsm_result.num_packets_ready, 1);
        let next_pdu = tb.get_next_sent_pdu().unwrap();
        let eof_pdu = EofPdu::from_bytes(next_pdu.raw_pdu()).expect("invalid EOF PDU format");
        tb.common_pdu_check_for_file_transfer(eof_pdu.pdu_header(), CrcFlag::NoCrc);
        assert_eq!(eof_pdu.condition_code(), ConditionCode::CheckLimitReached);
        assert_eq!(eof_pdu.file_size(), 0);
        assert_eq!(eof_pdu.file_checksum(), CRC_32.digest().finalize());
        assert_eq!(tb.handler.state(), State::Idle);

        // Cancellation fault should have been triggered.
        let fault_handler = tb.test_fault_handler_mut();
        let fh_ref_mut = fault_handler.get_mut();
        assert!(!fh_ref_mut.cancellation_queue_empty());
        assert_eq!(fh_ref_mut.notice_of_cancellation_queue.len(), 1);
        let FaultInfo {
            transaction_id,
            condition_code,
            progress,
        } = fh_ref_mut.notice_of_cancellation_queue.pop_back().unwrap();
        assert_eq!(transaction_id, expected_id);
        assert_eq!(condition_code, ConditionCode::CheckLimitReached);
        assert_eq!(progress, 0);
        fh_ref_mut.all_queues_empty();
        user.verify_finished_indication(
            DeliveryCode::Incomplete,
            ConditionCode::CheckLimitReached,
            expected_id,
            FileStatus::Unreported,
        );
    }

    #[test]
    fn test_cancelled_transfer_empty_file() {
        let mut tb = SourceHandlerTestbench::new(TransmissionMode::Unacknowledged, false, 512);
        let filesize = 0;
        let put_request = PutRequestOwned::new_regular_request(
            REMOTE_ID.into(),
            &tb.srcfile,
            &tb.destfile,
            Some(TransmissionMode::Unacknowledged),
            Some(false),
        )
        .expect("creating put request failed");
        let mut user = tb.create_user(0, filesize);
        assert_eq!(user.transaction_indication_call_count, 0);
        assert_eq!(user.eof_sent_call_count, 0);

        tb.put_request(&put_request)
            .expect("put_request call failed");
        assert_eq!(tb.handler.state(), State::Busy);
        assert_eq!(tb.handler.step(), TransactionStep::Idle);
        assert!(tb.get_next_sent_pdu().is_none());
        let id = tb.handler.transaction_id().unwrap();
        // The cancellation takes effect at the next state machine call.
        assert!(tb.handler.cancel_request(&id));
        assert_eq!(tb.handler.state(), State::Busy);
        tb.state_machine(&mut user);
        assert_eq!(tb.handler.state(), State::Idle);
        assert_eq!(tb.handler.step(), TransactionStep::Idle);
        // EOF (Cancel) PDU will be generated
        let eof_pdu = tb
            .get_next_sent_pdu()
            .expect("no EOF PDU generated like expected");
        assert_eq!(
            eof_pdu.file_directive_type.unwrap(),
            FileDirectiveType::Eof
        );
        let eof_pdu = EofPdu::from_bytes(eof_pdu.raw_pdu()).unwrap();
        assert_eq!(
            eof_pdu.condition_code(),
            ConditionCode::CancelRequestReceived
        );
        assert_eq!(eof_pdu.file_checksum(), CRC_32.digest().finalize());
        assert_eq!(eof_pdu.file_size(), 0);
        tb.common_pdu_check_for_file_transfer(eof_pdu.pdu_header(), CrcFlag::NoCrc);
    }

    #[test]
    fn test_cancelled_transfer_mid_transfer() {
        let mut tb = SourceHandlerTestbench::new(TransmissionMode::Unacknowledged, false, 128);
        let mut file = OpenOptions::new()
            .write(true)
            .open(&tb.srcfile)
            .expect("opening file failed");
        let mut rand_data = [0u8; 140];
        rand::rng().fill(&mut rand_data[..]);
        file.write_all(&rand_data)
            .expect("writing file content failed");
        drop(file);
        let put_request = PutRequestOwned::new_regular_request(
            REMOTE_ID.into(),
            &tb.srcfile,
            &tb.destfile,
            Some(TransmissionMode::Unacknowledged),
            Some(false),
        )
        .expect("creating put request failed");
        let file_size = rand_data.len() as u64;
        let mut user = tb.create_user(0, file_size);
        let transaction_info =
            tb.common_file_transfer_init_with_metadata_check(&mut user, put_request, file_size);
        let mut chunks = rand_data.chunks(
            calculate_max_file_seg_len_for_max_packet_len_and_pdu_header(
                &transaction_info.pdu_header,
                tb.max_packet_len,
                None,
            ),
        );
        let mut digest = CRC_32.digest();
        let first_chunk = chunks.next().expect("no chunk found");
        digest.update(first_chunk);
        let checksum = digest.finalize();
        let next_packet = tb.get_next_sent_pdu().unwrap();
        assert_eq!(next_packet.pdu_type, PduType::FileData);
        let fd_pdu = FileDataPdu::from_bytes(next_packet.raw_pdu()).unwrap();
        assert_eq!(fd_pdu.file_data(), &rand_data[0..first_chunk.len()]);
        let expected_id = tb.handler.transaction_id().unwrap();
        assert!(tb.handler.cancel_request(&expected_id));
        tb.state_machine(&mut user);
        assert_eq!(tb.handler.state(), State::Idle);
        assert_eq!(tb.handler.step(), TransactionStep::Idle);
        let next_packet = tb.get_next_sent_pdu().unwrap();
        assert_eq!(next_packet.pdu_type, PduType::FileDirective);
        assert_eq!(
            next_packet.file_directive_type.unwrap(),
            FileDirectiveType::Eof
        );
        // As specified in 4.11.2.2 of the standard, the file size will be the progress of the
        // file copy operation so far, and the checksum is calculated for that progress.
        let eof_pdu = EofPdu::from_bytes(next_packet.raw_pdu()).expect("EOF PDU creation failed");
        assert_eq!(eof_pdu.file_size(), first_chunk.len() as u64);
        assert_eq!(eof_pdu.file_checksum(), checksum);
        assert_eq!(
            eof_pdu.condition_code(),
            ConditionCode::CancelRequestReceived
        );
        // The EOF (Cancel) must attribute the fault to the cancelling entity: the raw PDU ends
        // with an entity ID TLV (type 6) containing the local entity ID.
        let raw = next_packet.raw_pdu();
        assert_eq!(&raw[raw.len() - 4..], &[0x06, 0x02, 0x00, 0x01]);
    }

    #[test]
    fn test_positive_ack_procedure() {
        let mut tb = SourceHandlerTestbench::new(TransmissionMode::Acknowledged, false, 512);
        let file_size = 0;
        let eof_params = EofParams::new_success(file_size, CRC_32.digest().finalize());
        let put_request = PutRequestOwned::new_regular_request(
            REMOTE_ID.into(),
            &tb.srcfile,
            &tb.destfile,
            Some(TransmissionMode::Acknowledged),
            Some(false),
        )
        .expect("creating put request failed");
        let mut user = tb.create_user(0, file_size);
        let transfer_info =
            tb.common_file_transfer_init_with_metadata_check(&mut user, put_request, file_size);
        tb.common_eof_pdu_check(&mut user, transfer_info.closure_requested, eof_params, 1);

        assert!(tb.pdu_queue_empty());

        // Enforce a positive ack timer expiry -> leads to a re-send of the EOF PDU.
        tb.expire_positive_ack_timer();
        let fsm_result = tb.state_machine(&mut user);
        assert_eq!(fsm_result.num_packets_ready, 1);
        tb.common_eof_pdu_check(&mut user, transfer_info.closure_requested, eof_params, 2);

        tb.acknowledge_eof_pdu(&mut user, &transfer_info);
        tb.finish_handling(&mut user, &transfer_info);
        tb.common_finished_pdu_ack_check();
        user.verify_finished_indication_retained(
            DeliveryCode::Complete,
            ConditionCode::NoError,
            transfer_info.id,
        );
    }

    #[test]
    fn test_positive_ack_procedure_ack_limit_reached() {
        let mut tb = SourceHandlerTestbench::new(TransmissionMode::Acknowledged, false, 512);
        let file_size = 0;
        let mut eof_params = EofParams::new_success(file_size, CRC_32.digest().finalize());
        let put_request = PutRequestOwned::new_regular_request(
            REMOTE_ID.into(),
            &tb.srcfile,
            &tb.destfile,
            Some(TransmissionMode::Acknowledged),
            Some(false),
        )
        .expect("creating put request failed");
        let mut user = tb.create_user(0, file_size);
        let transfer_info =
            tb.common_file_transfer_init_with_metadata_check(&mut user, put_request, file_size);
        tb.common_eof_pdu_check(&mut user, transfer_info.closure_requested, eof_params, 1);

        assert!(tb.pdu_queue_empty());

        // Enforce a positive ack timer expiry -> leads to a re-send of the EOF PDU.
        tb.expire_positive_ack_timer();
        let fsm_result = tb.state_machine(&mut user);
        assert_eq!(fsm_result.num_packets_ready, 1);
        tb.common_eof_pdu_check(&mut user, transfer_info.closure_requested, eof_params, 2);
        // Enforce a positive ack timer expiry -> positive ACK limit reached -> Cancel EOF sent.
        tb.expire_positive_ack_timer();
        let fsm_result = tb.state_machine(&mut user);
        assert_eq!(fsm_result.num_packets_ready, 1);
        eof_params.condition_code = ConditionCode::PositiveAckLimitReached;
        tb.common_eof_pdu_check(&mut user, transfer_info.closure_requested, eof_params, 3);
        // Cancellation fault should have been triggered.
        let fault_handler = tb.test_fault_handler_mut();
        let fh_ref_mut = fault_handler.get_mut();
        assert!(!fh_ref_mut.cancellation_queue_empty());
        assert_eq!(fh_ref_mut.notice_of_cancellation_queue.len(), 1);
        let FaultInfo {
            transaction_id,
            condition_code,
            progress,
        } = fh_ref_mut.notice_of_cancellation_queue.pop_back().unwrap();
        assert_eq!(transaction_id, transfer_info.id);
        assert_eq!(condition_code, ConditionCode::PositiveAckLimitReached);
        assert_eq!(progress, file_size);
        fh_ref_mut.all_queues_empty();
        // This boilerplate handling is still expected. In a real-life use-case I would expect
        // this to fail as well, leading to a transaction abandonment. This is tested separately.
        tb.acknowledge_eof_pdu(&mut user, &transfer_info);
        tb.finish_handling(&mut user, &transfer_info);
        tb.common_finished_pdu_ack_check();
        user.verify_finished_indication_retained(
            DeliveryCode::Complete,
            ConditionCode::NoError,
            transfer_info.id,
        );
    }

    #[test]
    fn test_positive_ack_procedure_ack_limit_reached_abandonment() {
        let mut tb = SourceHandlerTestbench::new(TransmissionMode::Acknowledged, false, 512);
        let file_size = 0;
        let mut eof_params = EofParams::new_success(file_size, CRC_32.digest().finalize());
        let put_request = PutRequestOwned::new_regular_request(
            REMOTE_ID.into(),
            &tb.srcfile,
            &tb.destfile,
            Some(TransmissionMode::Acknowledged),
            Some(false),
        )
        .expect("creating put request failed");
        let mut user = tb.create_user(0, file_size);
        let transfer_info =
            tb.common_file_transfer_init_with_metadata_check(&mut user, put_request, file_size);
        tb.common_eof_pdu_check(&mut user, transfer_info.closure_requested, eof_params, 1);

        assert!(tb.pdu_queue_empty());

        // Enforce a positive ack timer expiry -> leads to a re-send of the EOF PDU.
        tb.expire_positive_ack_timer();
        let fsm_result = tb.state_machine(&mut user);
        assert_eq!(fsm_result.num_packets_ready, 1);
        tb.common_eof_pdu_check(&mut user, transfer_info.closure_requested, eof_params, 2);
        // Enforce a positive ack timer expiry -> positive ACK limit reached -> Cancel EOF sent.
        tb.expire_positive_ack_timer();
        let fsm_result = tb.state_machine(&mut user);
        assert_eq!(fsm_result.num_packets_ready, 1);
        eof_params.condition_code = ConditionCode::PositiveAckLimitReached;
        tb.common_eof_pdu_check(&mut user, transfer_info.closure_requested, eof_params, 3);
        // Cancellation fault should have been triggered.
        let fault_handler = tb.test_fault_handler_mut();
        let fh_ref_mut = fault_handler.get_mut();
        assert!(!fh_ref_mut.cancellation_queue_empty());
        assert_eq!(fh_ref_mut.notice_of_cancellation_queue.len(), 1);
        let FaultInfo {
            transaction_id,
            condition_code,
            progress,
        } = fh_ref_mut.notice_of_cancellation_queue.pop_back().unwrap();
        assert_eq!(transaction_id, transfer_info.id);
        assert_eq!(condition_code, ConditionCode::PositiveAckLimitReached);
        assert_eq!(progress, file_size);
        fh_ref_mut.all_queues_empty();

        // Enforce a positive ack timer expiry -> leads to a re-send of the EOF Cancel PDU.
        tb.expire_positive_ack_timer();
        let fsm_result = tb.state_machine(&mut user);
        assert_eq!(fsm_result.num_packets_ready, 1);
        tb.common_eof_pdu_check(&mut user, transfer_info.closure_requested, eof_params, 4);

        // Enforce a positive ack timer expiry -> positive ACK limit reached -> Transaction
        // abandoned
        tb.expire_positive_ack_timer();
        let fsm_result = tb.state_machine(&mut user);
        assert_eq!(fsm_result.num_packets_ready, 0);
        // Abandonment fault should have been triggered.
        let fault_handler = tb.test_fault_handler_mut();
        let fh_ref_mut = fault_handler.get_mut();
        assert!(!fh_ref_mut.abandoned_queue_empty());
        assert_eq!(fh_ref_mut.abandoned_queue.len(), 1);
        let FaultInfo {
            transaction_id,
            condition_code,
            progress,
        } = fh_ref_mut.abandoned_queue.pop_back().unwrap();
        assert_eq!(transaction_id, transfer_info.id);
        assert_eq!(condition_code, ConditionCode::PositiveAckLimitReached);
        assert_eq!(progress, file_size);
        fh_ref_mut.all_queues_empty();
    }

    #[test]
    fn test_nak_for_whole_file() {
        let mut tb = SourceHandlerTestbench::new(TransmissionMode::Acknowledged, false, 512);
        let mut user = TestCfdpUser::default();
        let (data, transfer_info) = tb.common_tiny_file_transfer(&mut user, true);
        let seg_reqs = &[(0, transfer_info.file_size as u32)];
        let fsm_result = tb.nak_for_file_segments(&mut user, &transfer_info, seg_reqs);
        assert_eq!(fsm_result.num_packets_ready, 1);
        tb.check_next_file_pdu(0, data.as_bytes());
        tb.drain_retransmissions(&mut user);
        assert_eq!(tb.handler.step(), TransactionStep::WaitingForEofAck);
        tb.all_fault_queues_empty();

        tb.acknowledge_eof_pdu(&mut user, &transfer_info);
        tb.finish_handling(&mut user, &transfer_info);
        tb.common_finished_pdu_ack_check();
    }

    #[test]
    fn test_nak_for_file_segment() {
        let mut user = TestCfdpUser::default();
        let mut tb = SourceHandlerTestbench::new(TransmissionMode::Acknowledged, false, 128);
        let mut file = OpenOptions::new()
            .write(true)
            .open(&tb.srcfile)
            .expect("opening file failed");
        let mut rand_data = [0u8; 140];
        rand::rng().fill(&mut rand_data[..]);
        file.write_all(&rand_data)
            .expect("writing file content failed");
        drop(file);
        let (transfer_info, fd_pdus) =
            tb.generic_file_transfer(&mut user, false, rand_data.to_vec());
        assert_eq!(fd_pdus, 2);
        tb.nak_for_file_segments(&mut user, &transfer_info, &[(0, 90)]);
        tb.check_next_file_pdu(0, &rand_data[0..90]);
        tb.drain_retransmissions(&mut user);
        tb.all_fault_queues_empty();

        tb.acknowledge_eof_pdu(&mut user, &transfer_info);
        tb.finish_handling(&mut user, &transfer_info);
        tb.common_finished_pdu_ack_check();
    }

    #[test]
    fn test_nak_overlapping_segments_are_merged() {
        let mut user = TestCfdpUser::default();
        let mut tb = SourceHandlerTestbench::new(TransmissionMode::Acknowledged, false, 512);
        let mut file = OpenOptions::new()
            .write(true)
            .open(&tb.srcfile)
            .expect("opening file failed");
        let mut rand_data = [0u8; 100];
        rand::rng().fill(&mut rand_data[..]);
        file.write_all(&rand_data)
            .expect("writing file content failed");
        drop(file);
        let (transfer_info, fd_pdus) =
            tb.generic_file_transfer(&mut user, false, rand_data.to_vec());
        assert_eq!(fd_pdus, 1);
        // Two overlapping segment requests are merged and re-sent as one segment.
        let fsm_result =
            tb.nak_for_file_segments(&mut user, &transfer_info, &[(0, 50), (25, 75)]);
        assert_eq!(fsm_result.num_packets_ready, 1);
        tb.check_next_file_pdu(0, &rand_data[0..75]);
        tb.drain_retransmissions(&mut user);
        tb.all_fault_queues_empty();

        tb.acknowledge_eof_pdu(&mut user, &transfer_info);
        tb.finish_handling(&mut user, &transfer_info);
        tb.common_finished_pdu_ack_check();
    }

    #[test]
    fn test_nak_for_metadata() {
        let mut tb = SourceHandlerTestbench::new(TransmissionMode::Acknowledged, false, 512);
        let file_size = 0;
        let put_request = PutRequestOwned::new_regular_request(
            REMOTE_ID.into(),
            &tb.srcfile,
            &tb.destfile,
            Some(TransmissionMode::Acknowledged),
            Some(false),
        )
        .expect("creating put request failed");
        let mut user = tb.create_user(0, file_size);
        let transfer_info =
            tb.common_file_transfer_init_with_metadata_check(&mut user, put_request, file_size);
        tb.common_eof_pdu_check(
            &mut user,
            transfer_info.closure_requested,
            EofParams::new_success(file_size, CRC_32.digest().finalize()),
            1,
        );

        // NAK to cause re-transmission of metadata PDU.
        let fsm_result = tb.nak_for_file_segments(&mut user, &transfer_info, &[(0, 0)]);
        assert_eq!(fsm_result.num_packets_ready, 1);
        // A pure metadata re-request does not interrupt the current step.
        assert_eq!(tb.handler.step(), TransactionStep::WaitingForEofAck);
        let next_pdu = tb.get_next_sent_pdu().unwrap();
        // Check the metadata PDU.
        tb.metadata_check(&next_pdu, file_size);
        tb.all_fault_queues_empty();

        tb.acknowledge_eof_pdu(&mut user, &transfer_info);
        tb.finish_handling(&mut user, &transfer_info);
        tb.common_finished_pdu_ack_check();
        user.verify_finished_indication_retained(
            DeliveryCode::Complete,
            ConditionCode::NoError,
            transfer_info.id,
        );
    }

    #[test]
    fn test_metadata_only_transfer() {
        let mut tb = SourceHandlerTestbench::new(TransmissionMode::Unacknowledged, false, 512);
        let msg_to_user =
            spacepackets::cfdp::tlv::msg_to_user::MsgToUserTlv::new(&[1, 2, 3]).unwrap();
        let mut put_request =
            PutRequestOwned::new_msgs_to_user_only(REMOTE_ID.into(), &[msg_to_user])
                .expect("creating metadata only put request failed");
        put_request.closure_requested = Some(false);
        let mut user = tb.create_user(0, 0);
        tb.put_request(&put_request).expect("put request failed");
        let fsm_result = tb.state_machine(&mut user);
        // Only the metadata PDU is generated, no EOF PDU is required.
        assert_eq!(fsm_result.num_packets_ready, 1);
        assert_eq!(tb.handler.state(), State::Idle);
        let next_pdu = tb.get_next_sent_pdu().unwrap();
        assert_eq!(
            next_pdu.file_directive_type,
            Some(FileDirectiveType::Metadata)
        );
        let metadata_pdu =
            MetadataPduReader::new(next_pdu.raw_pdu()).expect("invalid metadata PDU format");
        assert!(metadata_pdu.src_file_name().is_empty());
        assert!(metadata_pdu.dest_file_name().is_empty());
        assert_eq!(
            metadata_pdu.metadata_params().checksum_type,
            ChecksumType::NullChecksum
        );
        assert!(!metadata_pdu.options().is_empty());
        assert_eq!(user.transaction_indication_call_count, 1);
        assert_eq!(user.eof_sent_call_count, 0);
        assert_eq!(user.finished_indic_queue.len(), 1);
    }
}
