//! # CFDP Destination Entity Module
//!
//! The [DestinationHandler] is the primary component of this module. It models the CFDP
//! destination entity, which receives file copy operations from a remote CFDP source entity and
//! re-assembles the received file data PDUs into a file inside the virtual filestore.
//!
//! The handler is driven by the [DestinationHandler::state_machine] method, which also doubles
//! as the packet insertion API. All PDUs generated as a response, for example ACK, NAK or
//! Finished PDUs, are placed into an internal queue and are retrieved using the
//! [DestinationHandler::get_next_pdu] method to be sent back through an arbitrary transport
//! layer.
//!
//! A new file transfer is started when a Metadata PDU for an unknown transaction is inserted
//! while the handler is in the idle state. In acknowledged mode, a File Data or EOF PDU will
//! start the transaction as well: the metadata is treated as a lost segment and re-requested
//! with the special (0, 0) segment request of a NAK PDU.
//!
//! The handler supports both unacknowledged and acknowledged transfers, including the deferred
//! lost segment procedure, the check limit procedure for unacknowledged transfers and the
//! positive acknowledgement procedure for the Finished PDU.
use core::{cell::Cell, cell::RefCell, str::Utf8Error, time::Duration};

use alloc::{collections::VecDeque, string::String, vec::Vec};
use smallvec::SmallVec;

use spacepackets::{
    cfdp::{
        lv::Lv,
        pdu::{
            ack::AckPdu,
            eof::EofPdu,
            file_data::FileDataPdu,
            finished::{DeliveryCode, FileStatus, FinishedPduCreator},
            metadata::MetadataPduReader,
            nak::NakPduCreator,
            CfdpPdu, CommonPduConfig, FileDirectiveType, PduError, PduHeader, WritablePduPacket,
        },
        tlv::{EntityIdTlv, GenericTlv, ReadableTlv, Tlv, TlvType},
        ChecksumType, ConditionCode, Direction, FaultHandlerCode, LargeFileFlag, PduType,
        TransactionStatus, TransmissionMode,
    },
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
    user::{CfdpUser, FileSegmentRecvdParams, MetadataReceivedParams, TransactionFinishedParams},
    LocalEntityConfig, PacketTarget, RemoteConfigStore, RemoteEntityConfig, State, TransactionId,
    UserFaultHook,
};

/// This enumeration models the different transaction steps of the destination entity handler.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransactionStep {
    Idle = 0,
    TransactionStart = 1,
    ReceivingFileData = 2,
    /// Issue the NAK sequence for the deferred lost segment procedure in acknowledged mode.
    SendingNaks = 3,
    /// Wait for lost metadata and file segments as part of the deferred lost segment procedure
    /// in acknowledged mode.
    WaitingForMissingData = 4,
    /// File transfer complete. Perform checksum verification and check limit handling. Please
    /// note that this does not necessarily mean that the file transfer was completed
    /// successfully.
    TransferCompletion = 5,
    SendingFinished = 6,
    WaitingForFinishedAck = 7,
    NoticeOfCompletion = 8,
}

/// Result of a [DestinationHandler::state_machine] call.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FsmResult {
    pub state: State,
    pub step: TransactionStep,
    /// Number of PDUs which are ready to be retrieved with [DestinationHandler::get_next_pdu].
    pub num_packets_ready: u32,
}

impl FsmResult {
    pub fn packets_ready(&self) -> bool {
        self.num_packets_ready > 0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DestError {
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
    #[error("invalid PDU direction for the destination handler")]
    InvalidPduDirection,
    #[error("PDU destination ID {found} does not match the local entity ID {expected}")]
    InvalidDestinationId { found: u64, expected: u64 },
    #[error("PDU source ID {found} does not match the active transaction source ID {expected}")]
    InvalidSourceId { found: u64, expected: u64 },
    #[error("no remote entity configuration found for {0:?}")]
    NoRemoteCfgFound(UnsignedByteField),
    #[error("first packet of a transaction in unacknowledged mode must be a metadata PDU")]
    FirstPacketNotMetadataPdu,
    #[error("file path does not have valid UTF8 format: {0}")]
    PathNotValidUtf8(#[from] Utf8Error),
    #[error("TLV with invalid format received")]
    TlvFormat,
    #[error("filestore error: {0}")]
    Filestore(#[from] FilestoreError),
    #[error("segment store error: {0}")]
    SegmentStore(#[from] SegmentError),
    #[error("error related to PDU creation: {0}")]
    Pdu(#[from] PduError),
}

#[derive(Debug, thiserror::Error)]
pub enum InactiveEofAckError {
    #[error("invalid transaction status for the acknowledgement of an inactive transaction")]
    InvalidTransactionStatus,
    #[error("error related to PDU creation: {0}")]
    Pdu(#[from] PduError),
}

/// This function can be used to fulfill chapter 4.7.2 of the CFDP standard: Every EOF PDU
/// received from the CFDP sender entity has to be acknowledged, even if the transaction ID of
/// the EOF PDU is not active at the receiver entity. The [TransactionStatus] is user provided
/// with the following options:
///
/// 1. [TransactionStatus::Undefined]: The CFDP implementation does not retain a transaction
///    history, so it might have been formerly active and terminated since then, or never active
///    at all.
/// 2. [TransactionStatus::Terminated]: The CFDP implementation does retain a transaction
///    history and the transaction is known to have been active at this entity.
/// 3. [TransactionStatus::Unrecognized]: The CFDP implementation does retain a transaction
///    history and the transaction has never been active at this entity.
pub fn acknowledge_inactive_eof_pdu(
    eof_pdu: &EofPdu,
    transaction_status: TransactionStatus,
) -> Result<AckPdu, InactiveEofAckError> {
    if transaction_status == TransactionStatus::Active {
        return Err(InactiveEofAckError::InvalidTransactionStatus);
    }
    let mut pdu_conf = *eof_pdu.pdu_header().common_pdu_conf();
    pdu_conf.direction = Direction::TowardsSender;
    Ok(AckPdu::new(
        PduHeader::new_for_file_directive(pdu_conf, 0),
        FileDirectiveType::Eof,
        eof_pdu.condition_code(),
        transaction_status,
    )
    .map_err(PduError::from)?)
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum CompletionDisposition {
    Completed = 0,
    Cancelled = 1,
}

#[derive(Debug, Default)]
struct FileParams {
    /// Full path of the file written to through the virtual filestore. This can differ from the
    /// destination path of the Metadata PDU if that path names a directory.
    file_name: String,
    src_file_name: String,
    dest_file_name: String,
    progress: u64,
    file_size: Option<u64>,
    metadata_received: bool,
    metadata_only: bool,
    eof_checksum: Option<u32>,
}

#[derive(Debug, Default)]
struct AckedModeParams {
    metadata_missing: bool,
    last_start_offset: u64,
    last_end_offset: u64,
    nak_activity_counter: u32,
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

struct TransactionParams<CountdownInstance: Countdown> {
    transaction_id: Option<TransactionId>,
    remote_cfg: Option<RemoteEntityConfig>,
    pdu_conf: CommonPduConfig,
    checksum_type: ChecksumType,
    closure_requested: bool,
    condition_code: ConditionCode,
    delivery_code: DeliveryCode,
    file_status: FileStatus,
    fault_location: Option<EntityIdTlv>,
    completion_disposition: CompletionDisposition,
    fp: FileParams,
    acked_params: AckedModeParams,
    metadata_options: Vec<u8>,
    check_timer: Option<CountdownInstance>,
    current_check_count: u32,
    nak_activity_timer: Option<CountdownInstance>,
    finished_ack_timer: Option<CountdownInstance>,
    positive_ack_params: Option<PositiveAckParams>,
}

impl<CountdownInstance: Countdown> Default for TransactionParams<CountdownInstance> {
    fn default() -> Self {
        Self {
            transaction_id: None,
            remote_cfg: None,
            pdu_conf: Default::default(),
            checksum_type: ChecksumType::NullChecksum,
            closure_requested: false,
            condition_code: ConditionCode::NoError,
            delivery_code: DeliveryCode::Incomplete,
            file_status: FileStatus::Unreported,
            fault_location: None,
            completion_disposition: CompletionDisposition::Completed,
            fp: Default::default(),
            acked_params: Default::default(),
            metadata_options: Vec::new(),
            check_timer: None,
            current_check_count: 0,
            nak_activity_timer: None,
            finished_ack_timer: None,
            positive_ack_params: None,
        }
    }
}

impl<CountdownInstance: Countdown> TransactionParams<CountdownInstance> {
    fn reset(&mut self) {
        *self = Default::default();
    }
}

/// This is the primary CFDP destination handler. It models the CFDP destination entity, which
/// is primarily responsible for receiving files sent from another CFDP entity. It performs the
/// reception side of File Copy Operations.
///
/// This handler is able to deal with file copy operations to directories, similarly to how the
/// UNIX tool `cp` works. If the destination path is a directory instead of a regular full path,
/// the source path base file name will be appended to the destination path to form the
/// resulting new full path.
///
/// The following core functions are the primary interface for interacting with the destination
/// handler:
///
/// 1. [Self::state_machine]: This state machine processes inserted packets while also
///    generating the packets which need to be sent back to the initiator of a file copy
///    operation. Please note that the destination handler can only process Metadata, File Data,
///    EOF and Prompt PDUs in addition to ACK PDUs where the acknowledged PDU is the Finished
///    PDU. The handler processes one packet at a time, and each packet insertion requires
///    another [Self::state_machine] call.
/// 2. [Self::get_next_pdu]: Retrieve the next packet to be sent back to the remote CFDP source
///    entity.
///
/// This handler does not support concurrency out of the box. Instead, if concurrent handling
/// is required, it is recommended to create a new handler and run all active handlers inside a
/// thread pool, or move the newly created handler to a new thread.
pub struct DestinationHandler<
    UserFaultHookInstance: UserFaultHook,
    Vfs: VirtualFilestore,
    RemoteConfigStoreInstance: RemoteConfigStore,
    TimerCreatorInstance: TimerCreator<Countdown = CountdownInstance>,
    CountdownInstance: Countdown,
    Segments: SegmentStore,
> {
    local_cfg: LocalEntityConfig<UserFaultHookInstance>,
    pdus_to_be_sent: RefCell<VecDeque<PduOwnedWithInfo>>,
    pdu_and_cksum_buffer: RefCell<Vec<u8>>,
    remote_cfg_table: RemoteConfigStoreInstance,
    vfs: Vfs,
    state_helper: StateHelper,
    tparams: TransactionParams<CountdownInstance>,
    // Segments of the file which were detected as lost and still need to be received.
    lost_segments: Segments,
    timer_creator: TimerCreatorInstance,
    cancel_pending: bool,
}

impl<
        UserFaultHookInstance: UserFaultHook,
        Vfs: VirtualFilestore,
        RemoteConfigStoreInstance: RemoteConfigStore,
        TimerCreatorInstance: TimerCreator<Countdown = CountdownInstance>,
        CountdownInstance: Countdown,
        Segments: SegmentStore,
    >
    DestinationHandler<
        UserFaultHookInstance,
        Vfs,
        RemoteConfigStoreInstance,
        TimerCreatorInstance,
        CountdownInstance,
        Segments,
    >
{
    /// Creates a new instance of a destination handler.
    ///
    /// # Arguments
    ///
    /// * `cfg` - The local entity configuration for this destination handler.
    /// * `pdu_and_cksum_buf_size` - The handler requires a buffer to generate PDUs and perform
    ///   checksum calculations. The user can specify the size of this buffer, so this should be
    ///   set to the maximum expected PDU size or a conservative upper bound for this size, for
    ///   example 2048 or 4096 bytes.
    /// * `vfs` - [VirtualFilestore] implementation used by the handler, which decouples the CFDP
    ///   implementation from the underlying filestore/filesystem.
    /// * `remote_cfg_table` - The [RemoteConfigStore] used to look up the remote entities which
    ///   send files to this entity.
    /// * `timer_creator` - [TimerCreator] used by the CFDP handler to generate timers required
    ///   by various tasks.
    /// * `lost_segments` - [SegmentStore] used to track the lost file segments for the
    ///   acknowledged transmission mode.
    pub fn new(
        cfg: LocalEntityConfig<UserFaultHookInstance>,
        pdu_and_cksum_buf_size: usize,
        vfs: Vfs,
        remote_cfg_table: RemoteConfigStoreInstance,
        timer_creator: TimerCreatorInstance,
        lost_segments: Segments,
    ) -> Self {
        Self {
            local_cfg: cfg,
            pdus_to_be_sent: RefCell::new(VecDeque::new()),
            pdu_and_cksum_buffer: RefCell::new(alloc::vec![0; pdu_and_cksum_buf_size]),
            remote_cfg_table,
            vfs,
            state_helper: Default::default(),
            tparams: Default::default(),
            lost_segments,
            timer_creator,
            cancel_pending: false,
        }
    }

    /// Calls [Self::state_machine], without inserting a packet.
    pub fn state_machine_no_packet(
        &mut self,
        cfdp_user: &mut impl CfdpUser,
        now: Duration,
    ) -> Result<FsmResult, DestError> {
        self.state_machine(cfdp_user, now, None::<&DummyPduProvider>)
    }

    /// This is the core function to drive the destination handler. It is also used to insert
    /// packets into the destination handler.
    ///
    /// The state machine should either be called if a packet with the appropriate destination
    /// ID is received, or periodically in IDLE periods to perform all CFDP related tasks, for
    /// example checking for timeouts or missed file segments.
    ///
    /// The `now` argument is a monotonic timestamp, for example the elapsed time since
    /// application start. It drives all timer related decisions of the handler.
    pub fn state_machine(
        &mut self,
        cfdp_user: &mut impl CfdpUser,
        now: Duration,
        pdu: Option<&impl PduProvider>,
    ) -> Result<FsmResult, DestError> {
        if let Some(packet) = pdu {
            self.insert_packet(cfdp_user, now, packet)?;
        }
        if self.cancel_pending && self.state() == super::State::Busy {
            self.cancel_pending = false;
            self.notice_of_cancellation(ConditionCode::CancelRequestReceived);
        }
        if self.state() == super::State::Busy {
            self.fsm_busy(cfdp_user, now)?;
        }
        Ok(self.fsm_result())
    }

    /// Retrieve the next packet which should be sent to the remote CFDP source entity.
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
    pub fn entity_id(&self) -> &UnsignedByteField {
        &self.local_cfg.id
    }

    #[inline]
    pub fn transaction_id(&self) -> Option<TransactionId> {
        self.tparams.transaction_id
    }

    /// Returns the [TransmissionMode] of the active transaction.
    #[inline]
    pub fn transmission_mode(&self) -> Option<TransmissionMode> {
        if self.state() == super::State::Idle {
            return None;
        }
        Some(self.tparams.pdu_conf.trans_mode)
    }

    /// Returns whether a closure was requested for the current transaction. Please note that
    /// this value is only valid as long as the state is not idle.
    #[inline]
    pub fn closure_requested(&self) -> bool {
        self.tparams.closure_requested
    }

    #[inline]
    pub fn step(&self) -> TransactionStep {
        self.state_helper.step
    }

    #[inline]
    pub fn state(&self) -> State {
        self.state_helper.state
    }

    /// Reception progress in bytes, the high-water mark of the received file data.
    #[inline]
    pub fn progress(&self) -> u64 {
        self.tparams.fp.progress
    }

    /// The file size of the current transaction. This will be [None] if no transfer is active
    /// or if neither a Metadata PDU nor an EOF PDU were received yet.
    #[inline]
    pub fn file_size(&self) -> Option<u64> {
        self.tparams.fp.file_size
    }

    /// This is the check counter used for the check limit mechanism for incomplete
    /// unacknowledged file transfers, see chapter 4.6.3.3 b) of the CFDP standard.
    #[inline]
    pub fn current_check_count(&self) -> u32 {
        self.tparams.current_check_count
    }

    #[inline]
    pub fn nak_activity_counter(&self) -> u32 {
        self.tparams.acked_params.nak_activity_counter
    }

    #[inline]
    pub fn positive_ack_counter(&self) -> u32 {
        self.tparams
            .positive_ack_params
            .map(|params| params.ack_counter)
            .unwrap_or(0)
    }

    #[inline]
    pub fn local_cfg(&self) -> &LocalEntityConfig<UserFaultHookInstance> {
        &self.local_cfg
    }

    /// This function models the Cancel.request CFDP primitive and is the recommended way to
    /// cancel a transaction. The cancellation is deferred: it becomes effective at the
    /// beginning of the next [Self::state_machine] call and will cause a Notice of Cancellation
    /// at this entity.
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
    pub fn reset(&mut self) {
        self.state_helper.step = TransactionStep::Idle;
        self.state_helper.state = super::State::Idle;
        self.tparams.reset();
        self.lost_segments.reset();
        self.cancel_pending = false;
        // The PDU queue is not cleared on purpose: packets which were already generated still
        // need to be retrieved and sent by the user.
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

    fn fsm_busy(&mut self, user: &mut impl CfdpUser, now: Duration) -> Result<(), DestError> {
        if self.step() == TransactionStep::SendingNaks {
            self.nak_fsm(now)?;
        }
        if self.step() == TransactionStep::WaitingForMissingData {
            self.handle_waiting_for_missing_data(now)?;
        }
        if self.step() == TransactionStep::TransferCompletion {
            self.handle_transfer_completion(now)?;
        }
        if self.step() == TransactionStep::SendingFinished {
            self.handle_sending_finished(now)?;
        }
        if self.step() == TransactionStep::WaitingForFinishedAck {
            self.handle_positive_ack_procedures(now)?;
        }
        if self.step() == TransactionStep::NoticeOfCompletion {
            self.notice_of_completion(user);
            self.reset();
        }
        Ok(())
    }

    fn insert_packet(
        &mut self,
        user: &mut impl CfdpUser,
        now: Duration,
        packet: &impl PduProvider,
    ) -> Result<(), DestError> {
        if packet.packet_target()? != PacketTarget::DestEntity {
            return Err(DestError::CantProcessPacketType {
                pdu_type: packet.pdu_type(),
                directive_type: packet.file_directive_type(),
            });
        }
        let (header, _header_len) = PduHeader::from_bytes(packet.raw_pdu())?;
        if header.common_pdu_conf().direction != Direction::TowardsReceiver {
            return Err(DestError::InvalidPduDirection);
        }
        // Entity ID validation only happens against the destination entity ID. A PDU with a
        // foreign destination ID does not belong to this entity and is not processed.
        if header.common_pdu_conf().dest_id().value() != self.local_cfg.id.value() {
            return Err(DestError::InvalidDestinationId {
                found: header.common_pdu_conf().dest_id().value(),
                expected: self.local_cfg.id.value(),
            });
        }
        if self.state() == super::State::Busy {
            // Mid-transaction, the source entity ID has to match the active transaction.
            let active_id = self.tparams.transaction_id.unwrap();
            if header.common_pdu_conf().source_id().value() != active_id.source_id().value() {
                return Err(DestError::InvalidSourceId {
                    found: header.common_pdu_conf().source_id().value(),
                    expected: active_id.source_id().value(),
                });
            }
            if header.common_pdu_conf().transaction_seq_num.value()
                != active_id.seq_num().value()
            {
                return Err(DestError::UnexpectedPdu {
                    pdu_type: packet.pdu_type(),
                    directive_type: packet.file_directive_type(),
                });
            }
        }
        match packet.pdu_type() {
            PduType::FileDirective => {
                match packet
                    .file_directive_type()
                    .expect("PDU directive type unexpectedly not set")
                {
                    FileDirectiveType::Metadata => {
                        let metadata_pdu = MetadataPduReader::new(packet.raw_pdu())?;
                        self.handle_metadata_pdu(user, now, &metadata_pdu, &header)?;
                    }
                    FileDirectiveType::Eof => {
                        let eof_pdu = EofPdu::from_bytes(packet.raw_pdu())?;
                        self.handle_eof_pdu(user, now, &eof_pdu, &header)?;
                    }
                    FileDirectiveType::Ack => {
                        let ack_pdu = AckPdu::from_bytes(packet.raw_pdu())?;
                        self.handle_ack_pdu(&ack_pdu)?;
                    }
                    // Prompt PDU handling is not implemented.
                    FileDirectiveType::Prompt => (),
                    FileDirectiveType::Finished
                    | FileDirectiveType::Nak
                    | FileDirectiveType::KeepAlive => {
                        return Err(DestError::CantProcessPacketType {
                            pdu_type: packet.pdu_type(),
                            directive_type: packet.file_directive_type(),
                        });
                    }
                }
            }
            PduType::FileData => {
                let fd_pdu = FileDataPdu::from_bytes(packet.raw_pdu())?;
                self.handle_file_data_pdu(user, now, &fd_pdu, &header)?;
            }
        }
        Ok(())
    }

    /// Start a new transaction for the first packet of a yet unknown transaction.
    fn common_transaction_start(&mut self, header: &PduHeader) -> Result<(), DestError> {
        let source_id = header.common_pdu_conf().source_id();
        let remote_cfg = self
            .remote_cfg_table
            .get(source_id.value())
            .ok_or(DestError::NoRemoteCfgFound(source_id))?;
        self.tparams.reset();
        self.lost_segments.reset();
        self.tparams.remote_cfg = Some(*remote_cfg);
        self.tparams.pdu_conf = *header.common_pdu_conf();
        self.tparams.pdu_conf.direction = Direction::TowardsSender;
        self.tparams.transaction_id = Some(TransactionId::new(
            source_id,
            header.common_pdu_conf().transaction_seq_num,
        ));
        self.state_helper.state = super::State::Busy;
        self.set_step(TransactionStep::TransactionStart);
        Ok(())
    }

    fn handle_metadata_pdu(
        &mut self,
        user: &mut impl CfdpUser,
        now: Duration,
        metadata_pdu: &MetadataPduReader,
        header: &PduHeader,
    ) -> Result<(), DestError> {
        if self.state() == super::State::Idle {
            self.common_transaction_start(header)?;
            return self.process_metadata(user, metadata_pdu);
        }
        if self.tparams.fp.metadata_received {
            return self.handle_metadata_duplicate(metadata_pdu);
        }
        // The metadata was missing for a transaction which was started by a File Data or EOF
        // PDU in acknowledged mode.
        self.process_metadata(user, metadata_pdu)?;
        // Reception of missing metadata resets the NAK activity parameters. See CFDP 4.6.4.7.
        if self.deferred_lost_segment_procedure_active() {
            self.reset_nak_activity_parameters(now);
        }
        Ok(())
    }

    fn handle_metadata_duplicate(
        &mut self,
        metadata_pdu: &MetadataPduReader,
    ) -> Result<(), DestError> {
        let params = metadata_pdu.metadata_params();
        let src_name = metadata_pdu
            .src_file_name()
            .value_as_str()
            .transpose()?
            .unwrap_or("");
        let dest_name = metadata_pdu
            .dest_file_name()
            .value_as_str()
            .transpose()?
            .unwrap_or("");
        if params.file_size == self.tparams.fp.file_size.unwrap_or(0)
            && params.checksum_type == self.tparams.checksum_type
            && params.closure_requested == self.tparams.closure_requested
            && src_name == self.tparams.fp.src_file_name
            && dest_name == self.tparams.fp.dest_file_name
        {
            // An identical duplicate is simply ignored.
            return Ok(());
        }
        self.declare_fault(ConditionCode::InvalidFileStructure);
        Ok(())
    }

    fn process_metadata(
        &mut self,
        user: &mut impl CfdpUser,
        metadata_pdu: &MetadataPduReader,
    ) -> Result<(), DestError> {
        let params = metadata_pdu.metadata_params();
        self.tparams.checksum_type = params.checksum_type;
        self.tparams.closure_requested = params.closure_requested;
        self.tparams.fp.file_size = Some(params.file_size);
        self.tparams.fp.metadata_received = true;
        self.tparams.acked_params.metadata_missing = false;
        let src_name = metadata_pdu
            .src_file_name()
            .value_as_str()
            .transpose()?
            .unwrap_or("");
        let dest_name = metadata_pdu
            .dest_file_name()
            .value_as_str()
            .transpose()?
            .unwrap_or("");
        self.tparams.fp.src_file_name = src_name.into();
        self.tparams.fp.dest_file_name = dest_name.into();
        self.tparams.metadata_options = metadata_pdu.options().to_vec();
        if src_name.is_empty() || dest_name.is_empty() {
            self.tparams.fp.metadata_only = true;
            self.tparams.delivery_code = DeliveryCode::Complete;
        } else {
            self.init_vfs_handling()?;
        }
        if self.step() == TransactionStep::TransactionStart {
            if self.tparams.fp.metadata_only {
                self.set_step(TransactionStep::TransferCompletion);
            } else {
                self.set_step(TransactionStep::ReceivingFileData);
            }
        }
        // Only the message to user TLVs are part of the metadata received indication.
        let mut msgs_to_user: SmallVec<[u8; 64]> = SmallVec::new();
        self.for_each_option_tlv(|tlv| {
            if tlv.tlv_type() == Some(TlvType::MsgToUser) {
                msgs_to_user.extend_from_slice(tlv.value());
            }
        })?;
        let metadata_recvd_params = MetadataReceivedParams {
            id: self.tparams.transaction_id.unwrap(),
            source_id: *self.tparams.transaction_id.unwrap().source_id(),
            file_size: params.file_size,
            src_file_name: src_name,
            dest_file_name: dest_name,
            msgs_to_user: &msgs_to_user,
        };
        user.metadata_recvd_indication(&metadata_recvd_params);
        Ok(())
    }

    /// Create the destination file. If the destination path is a directory, the source path
    /// base file name is appended to it first. Filestore errors lead to a Filestore Rejection
    /// fault instead of an error return value.
    fn init_vfs_handling(&mut self) -> Result<(), DestError> {
        let file_name = match self.build_dest_file_path() {
            Ok(file_name) => file_name,
            Err(error) => return self.filestore_rejection(error),
        };
        self.tparams.fp.file_name = file_name;
        let create_result = (|| {
            if self.vfs.exists(&self.tparams.fp.file_name)? {
                self.vfs.truncate_file(&self.tparams.fp.file_name)?;
            } else {
                self.vfs.create_file(&self.tparams.fp.file_name)?;
            }
            Ok(())
        })();
        match create_result {
            Ok(()) => {
                self.tparams.file_status = FileStatus::Retained;
                Ok(())
            }
            Err(error) => self.filestore_rejection(error),
        }
    }

    fn build_dest_file_path(&self) -> Result<String, FilestoreError> {
        let dest_name = &self.tparams.fp.dest_file_name;
        if self.vfs.exists(dest_name)? && self.vfs.is_dir(dest_name)? {
            let base_name = self
                .vfs
                .file_name(&self.tparams.fp.src_file_name)?
                .ok_or(FilestoreError::Utf8Error)?;
            let mut full_path = String::from(dest_name.as_str());
            if !full_path.ends_with('/') {
                full_path.push('/');
            }
            full_path.push_str(base_name);
            return Ok(full_path);
        }
        Ok(dest_name.clone())
    }

    fn filestore_rejection(&mut self, error: FilestoreError) -> Result<(), DestError> {
        if self.tparams.file_status != FileStatus::Retained {
            self.tparams.file_status = FileStatus::DiscardedFsRejection;
        }
        self.declare_fault(ConditionCode::FilestoreRejection);
        // The error was converted into a fault, the packet itself was processed.
        let _ = error;
        Ok(())
    }

    fn handle_file_data_pdu(
        &mut self,
        user: &mut impl CfdpUser,
        now: Duration,
        fd_pdu: &FileDataPdu,
        header: &PduHeader,
    ) -> Result<(), DestError> {
        if self.state() == super::State::Idle {
            // Metadata need not precede file data: in acknowledged mode, the transaction is
            // started and the metadata is re-requested.
            if header.common_pdu_conf().trans_mode == TransmissionMode::Unacknowledged {
                return Err(DestError::FirstPacketNotMetadataPdu);
            }
            self.common_transaction_start(header)?;
            self.tparams.acked_params.metadata_missing = true;
            self.set_step(TransactionStep::ReceivingFileData);
        }
        match self.step() {
            TransactionStep::ReceivingFileData
            | TransactionStep::SendingNaks
            | TransactionStep::WaitingForMissingData
            | TransactionStep::TransferCompletion => (),
            // Late duplicates are dropped silently.
            _ => return Ok(()),
        }
        if self.tparams.acked_params.metadata_missing {
            self.handle_file_data_without_metadata(fd_pdu)?;
            return Ok(());
        }
        let offset = fd_pdu.offset();
        let data_len = fd_pdu.file_data().len() as u64;
        if self.local_cfg.indication_cfg.file_segment_recv {
            let segment_params = FileSegmentRecvdParams {
                id: self.tparams.transaction_id.unwrap(),
                offset,
                length: fd_pdu.file_data().len(),
                segment_metadata: fd_pdu.segment_metadata(),
            };
            user.file_segment_recvd_indication(&segment_params);
        }
        if let Err(error) = self
            .vfs
            .write_data(&self.tparams.fp.file_name, offset, fd_pdu.file_data())
        {
            return self.filestore_rejection(error);
        }
        self.tparams.file_status = FileStatus::Retained;
        // CFDP 4.6.1.2.7 c): If the sum of the file data PDU offset and segment size exceeds
        // the declared file size, a File Size Error fault shall be declared.
        if offset + data_len > self.tparams.fp.file_size.unwrap_or(u64::MAX)
            && self.declare_fault(ConditionCode::FileSizeError) != FaultHandlerCode::IgnoreError
        {
            return Ok(());
        }
        self.tparams.fp.progress = core::cmp::max(offset + data_len, self.tparams.fp.progress);
        if self.transmission_mode().unwrap() == TransmissionMode::Acknowledged {
            self.lost_segment_handling(now, offset, data_len)?;
        }
        Ok(())
    }

    /// In acknowledged mode, file data which arrives before the metadata can not be written
    /// yet because the destination path is unknown. The whole span up to the received end
    /// offset is tracked as lost and will be re-requested together with the metadata.
    fn handle_file_data_without_metadata(&mut self, fd_pdu: &FileDataPdu) -> Result<(), DestError> {
        let end_offset = fd_pdu.offset() + fd_pdu.file_data().len() as u64;
        self.tparams.fp.progress = core::cmp::max(end_offset, self.tparams.fp.progress);
        if end_offset > 0 {
            self.lost_segments.add_segment((0, self.tparams.fp.progress))?;
            self.tparams.acked_params.last_start_offset = self.tparams.fp.progress;
            self.tparams.acked_params.last_end_offset = self.tparams.fp.progress;
        }
        if self.tparams.remote_cfg.as_ref().unwrap().immediate_nak_mode
            && !self.deferred_lost_segment_procedure_active()
        {
            let mut seg_reqs: SmallVec<[(u64, u64); 2]> = SmallVec::new();
            seg_reqs.push((0, 0));
            if end_offset > 0 {
                seg_reqs.push((0, self.tparams.fp.progress));
            }
            self.queue_nak_pdu(&seg_reqs, 0, self.tparams.fp.progress)?;
        }
        Ok(())
    }

    /// Lost segment detection: 4.6.4.3.1 a) and b) are covered by this code. c) is covered
    /// by dedicated code which is run when the EOF PDU is handled.
    fn lost_segment_handling(
        &mut self,
        now: Duration,
        offset: u64,
        data_len: u64,
    ) -> Result<(), DestError> {
        if offset > self.tparams.acked_params.last_end_offset {
            let lost_segment = (self.tparams.acked_params.last_end_offset, offset);
            self.lost_segments.add_segment(lost_segment)?;
            if self.tparams.remote_cfg.as_ref().unwrap().immediate_nak_mode
                && !self.deferred_lost_segment_procedure_active()
            {
                self.queue_nak_pdu(&[lost_segment], 0, offset + data_len)?;
            }
        }
        if offset >= self.tparams.acked_params.last_end_offset {
            self.tparams.acked_params.last_start_offset = offset;
            self.tparams.acked_params.last_end_offset = offset + data_len;
        }
        if offset + data_len <= self.tparams.acked_params.last_start_offset {
            // Might be a re-requested file data PDU. Duplicate data is allowed to overlap the
            // boundaries of tracked lost segments, such removals are no-ops.
            let removed = match self.lost_segments.remove_segment((offset, offset + data_len)) {
                Ok(removed) => removed,
                Err(SegmentError::InvalidSegmentBoundary(_, _)) => false,
                Err(error) => return Err(error.into()),
            };
            // Reception of missing segments resets the NAK activity parameters.
            // See CFDP 4.6.4.7.
            if removed && self.deferred_lost_segment_procedure_active() {
                self.reset_nak_activity_parameters(now);
            }
        }
        Ok(())
    }

    fn handle_eof_pdu(
        &mut self,
        user: &mut impl CfdpUser,
        now: Duration,
        eof_pdu: &EofPdu,
        header: &PduHeader,
    ) -> Result<(), DestError> {
        if self.state() == super::State::Idle {
            // An EOF PDU as the first packet of a transaction is only valid in acknowledged
            // mode, where the metadata and all file data are simply re-requested.
            if header.common_pdu_conf().trans_mode == TransmissionMode::Unacknowledged {
                return Err(DestError::FirstPacketNotMetadataPdu);
            }
            self.common_transaction_start(header)?;
            self.tparams.acked_params.metadata_missing = true;
            self.set_step(TransactionStep::ReceivingFileData);
        }
        match self.step() {
            TransactionStep::ReceivingFileData
            | TransactionStep::SendingNaks
            | TransactionStep::WaitingForMissingData
            | TransactionStep::TransferCompletion => (),
            _ => {
                return Err(DestError::UnexpectedPdu {
                    pdu_type: PduType::FileDirective,
                    directive_type: Some(FileDirectiveType::Eof),
                })
            }
        }
        let duplicate_eof = self.tparams.fp.eof_checksum.is_some();
        self.tparams.fp.eof_checksum = Some(eof_pdu.file_checksum());
        self.tparams.fp.file_size = Some(
            self.tparams
                .fp
                .file_size
                .unwrap_or(eof_pdu.file_size())
                .max(eof_pdu.file_size()),
        );
        if duplicate_eof {
            // Every EOF PDU needs to be acknowledged in acknowledged mode, even repeated ones.
            if self.transmission_mode().unwrap() == TransmissionMode::Acknowledged {
                self.queue_eof_ack_pdu()?;
            }
            return Ok(());
        }
        if self.local_cfg.indication_cfg.eof_recv {
            user.eof_recvd_indication(&self.tparams.transaction_id.unwrap());
        }
        if eof_pdu.condition_code() == ConditionCode::NoError {
            let declared_file_size = eof_pdu.file_size();
            // CFDP 4.6.1.2.9: Declare a file size error if the progress exceeds the file size
            // declared in the EOF PDU.
            if self.tparams.fp.progress > declared_file_size {
                if self.declare_fault(ConditionCode::FileSizeError)
                    != FaultHandlerCode::IgnoreError
                {
                    return Ok(());
                }
            } else if self.tparams.fp.progress < declared_file_size
                && self.transmission_mode().unwrap() == TransmissionMode::Acknowledged
            {
                // CFDP 4.6.4.3.1 c): The end offset of the last received file segment and the
                // file size as stated in the EOF PDU are not the same, so that segment is added
                // to the lost segments for the deferred lost segment procedure.
                self.lost_segments
                    .add_segment((self.tparams.fp.progress, declared_file_size))?;
            }
        } else {
            self.handle_eof_cancel(eof_pdu)?;
        }
        if self.transmission_mode().unwrap() == TransmissionMode::Unacknowledged {
            self.set_step(TransactionStep::TransferCompletion);
        } else {
            self.queue_eof_ack_pdu()?;
            if self.tparams.completion_disposition == CompletionDisposition::Cancelled {
                self.set_step(TransactionStep::TransferCompletion);
            } else if self.tparams.acked_params.metadata_missing
                || !self.lost_segments.is_empty()
            {
                self.start_deferred_lost_segment_handling();
            } else {
                self.set_step(TransactionStep::TransferCompletion);
            }
        }
        Ok(())
    }

    /// This is an EOF (Cancel), perform the Cancel Response Procedures according to chapter
    /// 4.6.6 of the standard. The remote entity is the fault location.
    fn handle_eof_cancel(&mut self, eof_pdu: &EofPdu) -> Result<(), DestError> {
        self.tparams.completion_disposition = CompletionDisposition::Cancelled;
        self.tparams.condition_code = eof_pdu.condition_code();
        self.tparams.fault_location = Some(EntityIdTlv::new(
            self.tparams.remote_cfg.as_ref().unwrap().entity_id,
        ));
        // A file copy operation which was cut short can not deliver the complete file, the
        // only exception being the empty file with no file data at all.
        if !self.tparams.acked_params.metadata_missing
            && eof_pdu.file_size() == 0
            && self.tparams.fp.progress == 0
        {
            self.tparams.delivery_code = DeliveryCode::Complete;
        } else {
            self.tparams.delivery_code = DeliveryCode::Incomplete;
        }
        Ok(())
    }

    fn start_deferred_lost_segment_handling(&mut self) {
        self.tparams.acked_params.last_start_offset = self.tparams.fp.file_size.unwrap_or(0);
        self.tparams.acked_params.last_end_offset = self.tparams.fp.file_size.unwrap_or(0);
        self.tparams.acked_params.nak_activity_counter = 0;
        self.set_step(TransactionStep::SendingNaks);
    }

    fn deferred_lost_segment_procedure_active(&self) -> bool {
        matches!(
            self.step(),
            TransactionStep::SendingNaks | TransactionStep::WaitingForMissingData
        )
    }

    fn reset_nak_activity_parameters(&mut self, now: Duration) {
        self.tparams.acked_params.nak_activity_counter = 0;
        if let Some(timer) = self.tparams.nak_activity_timer.as_mut() {
            timer.reset(now);
        }
    }

    fn nak_fsm(&mut self, now: Duration) -> Result<(), DestError> {
        self.queue_nak_pdus_for_lost_segments()?;
        if self.tparams.nak_activity_timer.is_none() {
            self.tparams.nak_activity_timer = Some(self.timer_creator.create_countdown(
                TimerContext::NakActivity {
                    expiry_time: self
                        .tparams
                        .remote_cfg
                        .as_ref()
                        .unwrap()
                        .nak_timer_interval,
                },
                now,
            ));
        } else {
            self.tparams.nak_activity_timer.as_mut().unwrap().reset(now);
        }
        // At most one of the receiver side timers is armed at any time.
        self.tparams.check_timer = None;
        self.tparams.finished_ack_timer = None;
        self.set_step(TransactionStep::WaitingForMissingData);
        Ok(())
    }

    fn handle_waiting_for_missing_data(&mut self, now: Duration) -> Result<(), DestError> {
        if !self.tparams.acked_params.metadata_missing && self.lost_segments.is_empty() {
            self.tparams.nak_activity_timer = None;
            self.set_step(TransactionStep::TransferCompletion);
            return Ok(());
        }
        let expired = self
            .tparams
            .nak_activity_timer
            .as_ref()
            .map(|timer| timer.has_expired(now))
            .unwrap_or(false);
        if !expired {
            return Ok(());
        }
        let nak_activity_limit = self
            .tparams
            .remote_cfg
            .as_ref()
            .unwrap()
            .nak_timer_expiration_limit;
        if self.tparams.acked_params.nak_activity_counter + 1 >= nak_activity_limit {
            self.tparams.delivery_code = DeliveryCode::Incomplete;
            self.declare_fault(ConditionCode::NakLimitReached);
            return Ok(());
        }
        self.tparams.acked_params.nak_activity_counter += 1;
        self.tparams.nak_activity_timer.as_mut().unwrap().reset(now);
        self.queue_nak_pdus_for_lost_segments()?;
        Ok(())
    }

    fn handle_transfer_completion(&mut self, now: Duration) -> Result<(), DestError> {
        if self.tparams.completion_disposition == CompletionDisposition::Completed
            && !self.tparams.fp.metadata_only
        {
            if self.transmission_mode().unwrap() == TransmissionMode::Acknowledged
                && (self.tparams.acked_params.metadata_missing || !self.lost_segments.is_empty())
            {
                self.set_step(TransactionStep::SendingNaks);
                return Ok(());
            }
            let verify_size = self
                .tparams
                .fp
                .file_size
                .unwrap_or(self.tparams.fp.progress);
            if self.tparams.check_timer.is_some() {
                // Check limit handling as specified in chapter 4.6.3.3 of the standard is
                // active, file data PDUs might still arrive and complete the transfer.
                if !self.tparams.check_timer.as_ref().unwrap().has_expired(now) {
                    return Ok(());
                }
                if self.file_checksum_verify(verify_size)? {
                    self.tparams.delivery_code = DeliveryCode::Complete;
                    self.tparams.condition_code = ConditionCode::NoError;
                } else if self.tparams.current_check_count + 1
                    >= self.tparams.remote_cfg.as_ref().unwrap().check_limit
                {
                    self.declare_fault(ConditionCode::CheckLimitReached);
                } else {
                    self.tparams.current_check_count += 1;
                    self.tparams.check_timer.as_mut().unwrap().reset(now);
                    return Ok(());
                }
            } else if self.file_checksum_verify(verify_size)? {
                self.tparams.delivery_code = DeliveryCode::Complete;
                self.tparams.condition_code = ConditionCode::NoError;
            } else if self.transmission_mode().unwrap() == TransmissionMode::Unacknowledged {
                // The file may still be incomplete due to out-of-order reception, start the
                // check limit handling as specified in chapter 4.6.3.3 b) of the standard.
                self.tparams.check_timer = Some(self.timer_creator.create_countdown(
                    TimerContext::CheckLimit {
                        expiry_time: self
                            .tparams
                            .remote_cfg
                            .as_ref()
                            .unwrap()
                            .check_timer_interval,
                    },
                    now,
                ));
                self.tparams.current_check_count = 0;
                return Ok(());
            } else {
                // Acknowledged mode: all file data was received but the checksum still does
                // not match.
                self.tparams.delivery_code = DeliveryCode::Incomplete;
                if self.declare_fault(ConditionCode::FileChecksumFailure)
                    == FaultHandlerCode::IgnoreError
                {
                    self.tparams.condition_code = ConditionCode::FileChecksumFailure;
                }
            }
        }
        if self.state() == super::State::Idle {
            // The transaction was abandoned by a fault handler.
            return Ok(());
        }
        self.tparams.check_timer = None;
        self.tparams.nak_activity_timer = None;
        if self.transmission_mode().unwrap() == TransmissionMode::Unacknowledged
            && !self.tparams.closure_requested
        {
            self.set_step(TransactionStep::NoticeOfCompletion);
        } else {
            self.set_step(TransactionStep::SendingFinished);
        }
        Ok(())
    }

    fn handle_sending_finished(&mut self, now: Duration) -> Result<(), DestError> {
        if self.tparams.completion_disposition == CompletionDisposition::Completed {
            self.handle_filestore_requests();
        }
        self.queue_finished_pdu()?;
        if self.transmission_mode().unwrap() == TransmissionMode::Acknowledged {
            self.start_positive_ack_procedure(now);
            self.set_step(TransactionStep::WaitingForFinishedAck);
        } else {
            self.set_step(TransactionStep::NoticeOfCompletion);
        }
        Ok(())
    }

    fn start_positive_ack_procedure(&mut self, now: Duration) {
        match self.tparams.positive_ack_params.as_mut() {
            Some(current) => current.ack_counter = 0,
            None => self.tparams.positive_ack_params = Some(PositiveAckParams::default()),
        }
        self.tparams.finished_ack_timer = Some(self.timer_creator.create_countdown(
            TimerContext::PositiveAck {
                expiry_time: self
                    .tparams
                    .remote_cfg
                    .as_ref()
                    .unwrap()
                    .positive_ack_timer_interval,
            },
            now,
        ));
        self.tparams.check_timer = None;
        self.tparams.nak_activity_timer = None;
    }

    /// Positive ACK procedures for the Finished PDU according to chapter 4.7.1 of the CFDP
    /// standard.
    fn handle_positive_ack_procedures(&mut self, now: Duration) -> Result<(), DestError> {
        let Some(mut positive_ack_params) = self.tparams.positive_ack_params else {
            return Ok(());
        };
        if !self
            .tparams
            .finished_ack_timer
            .as_ref()
            .unwrap()
            .has_expired(now)
        {
            return Ok(());
        }
        let ack_limit = self
            .tparams
            .remote_cfg
            .as_ref()
            .unwrap()
            .positive_ack_timer_expiration_limit;
        if positive_ack_params.ack_counter + 1 >= ack_limit {
            self.declare_fault(ConditionCode::PositiveAckLimitReached);
            // The re-sent Finished PDU of the cancelled transaction is generated by the
            // transfer completion step at the next state machine call.
            return Ok(());
        }
        self.tparams
            .finished_ack_timer
            .as_mut()
            .unwrap()
            .reset(now);
        positive_ack_params.ack_counter += 1;
        self.tparams.positive_ack_params = Some(positive_ack_params);
        self.queue_finished_pdu()?;
        Ok(())
    }

    fn handle_ack_pdu(&mut self, ack_pdu: &AckPdu) -> Result<(), DestError> {
        if self.step() != TransactionStep::WaitingForFinishedAck {
            return Err(DestError::UnexpectedPdu {
                pdu_type: PduType::FileDirective,
                directive_type: Some(FileDirectiveType::Ack),
            });
        }
        if ack_pdu.directive_code_of_acked_pdu() == FileDirectiveType::Finished {
            self.tparams.finished_ack_timer = None;
            self.tparams.positive_ack_params = None;
            self.set_step(TransactionStep::NoticeOfCompletion);
        }
        Ok(())
    }

    fn notice_of_cancellation(&mut self, condition_code: ConditionCode) {
        self.tparams.completion_disposition = CompletionDisposition::Cancelled;
        self.tparams.condition_code = condition_code;
        self.tparams.fault_location = Some(EntityIdTlv::new(self.local_cfg.id));
        self.set_step(TransactionStep::TransferCompletion);
    }

    pub fn abandon_transaction(&mut self) {
        // I guess an abandoned transaction just stops whatever the handler is doing and resets
        // it to a clean state.. The implementation for this is quite easy.
        self.reset();
    }

    fn declare_fault(&mut self, cond: ConditionCode) -> FaultHandlerCode {
        let mut fh_code = self.local_cfg.fault_handler.get_fault_handler(cond);
        // CFDP standard 4.11.2.3.3: Any fault declared while the Finished (Cancel) PDU is
        // transferred must result in abandonment of the transaction.
        if self.tparams.completion_disposition == CompletionDisposition::Cancelled
            && fh_code == FaultHandlerCode::NoticeOfCancellation
        {
            fh_code = FaultHandlerCode::AbandonTransaction;
        }
        let fault_info = FaultInfo::new(
            self.tparams.transaction_id.unwrap(),
            cond,
            self.tparams.fp.progress,
        );
        match fh_code {
            FaultHandlerCode::NoticeOfCancellation => {
                self.notice_of_cancellation(cond);
            }
            FaultHandlerCode::NoticeOfSuspension => (),
            FaultHandlerCode::IgnoreError => (),
            FaultHandlerCode::AbandonTransaction => {
                self.abandon_transaction();
            }
        }
        self.local_cfg.fault_handler.report_fault(fh_code, fault_info);
        fh_code
    }

    fn notice_of_completion(&mut self, user: &mut impl CfdpUser) {
        if self.tparams.completion_disposition == CompletionDisposition::Cancelled
            && !self.tparams.fp.metadata_only
            && self.tparams.delivery_code == DeliveryCode::Incomplete
            && self
                .tparams
                .remote_cfg
                .as_ref()
                .is_some_and(|cfg| cfg.disposition_on_cancellation)
            && self.tparams.file_status == FileStatus::Retained
        {
            if self.vfs.remove_file(&self.tparams.fp.file_name).is_ok() {
                self.tparams.file_status = FileStatus::DiscardDeliberately;
            }
        }
        if self.local_cfg.indication_cfg.transaction_finished {
            let finished_indic_params = TransactionFinishedParams {
                id: self.tparams.transaction_id.unwrap(),
                condition_code: self.tparams.condition_code,
                delivery_code: self.tparams.delivery_code,
                file_status: self.tparams.file_status,
            };
            user.transaction_finished_indication(&finished_indic_params);
        }
    }

    fn file_checksum_verify(&mut self, size_to_verify: u64) -> Result<bool, DestError> {
        if self.tparams.checksum_type == ChecksumType::NullChecksum
            || self.tparams.fp.metadata_only
        {
            return Ok(true);
        }
        let Some(expected_checksum) = self.tparams.fp.eof_checksum else {
            return Ok(false);
        };
        Ok(self.vfs.checksum_verify(
            expected_checksum,
            &self.tparams.fp.file_name,
            self.tparams.checksum_type,
            size_to_verify,
            &mut self.pdu_and_cksum_buffer.borrow_mut(),
        )?)
    }

    /// Apply the filestore requests received with the Metadata PDU in order, stopping at the
    /// first rejected request. A rejection is reflected in the Finished PDU parameters but is
    /// not a cause for transaction cancellation.
    fn handle_filestore_requests(&mut self) {
        let options = core::mem::take(&mut self.tparams.metadata_options);
        let mut rejection = false;
        let _ = self.for_each_tlv_in(&options, |handler, tlv| {
            if rejection || tlv.tlv_type() != Some(TlvType::FilestoreRequest) {
                return;
            }
            if handler.execute_filestore_request(tlv.value()).is_err() {
                rejection = true;
            }
        });
        if rejection {
            self.tparams.condition_code = ConditionCode::FilestoreRejection;
            self.tparams.delivery_code = DeliveryCode::Incomplete;
            self.tparams.fault_location = Some(EntityIdTlv::new(self.local_cfg.id));
            let fault_info = FaultInfo::new(
                self.tparams.transaction_id.unwrap(),
                ConditionCode::FilestoreRejection,
                self.tparams.fp.progress,
            );
            self.local_cfg
                .fault_handler
                .report_fault(FaultHandlerCode::IgnoreError, fault_info);
        }
    }

    fn execute_filestore_request(&self, value: &[u8]) -> Result<(), FilestoreError> {
        if value.is_empty() {
            return Err(FilestoreError::Other);
        }
        let action_code = (value[0] >> 4) & 0b1111;
        let first_lv =
            Lv::from_bytes(&value[1..]).map_err(|_| FilestoreError::Other)?;
        let first_name = first_lv
            .value_as_str()
            .transpose()
            .map_err(|_| FilestoreError::Utf8Error)?
            .ok_or(FilestoreError::Other)?;
        let second_name_offset = 1 + first_lv.len_full();
        let second_name = if value.len() > second_name_offset {
            Lv::from_bytes(&value[second_name_offset..])
                .map_err(|_| FilestoreError::Other)?
                .value_as_str()
                .transpose()
                .map_err(|_| FilestoreError::Utf8Error)?
        } else {
            None
        };
        let second_name_required = || second_name.ok_or(FilestoreError::Other);
        // Filestore request action codes as specified in chapter 5.4, table 5-15 of the CFDP
        // standard.
        match action_code {
            0b0000 => self.vfs.create_file(first_name),
            0b0001 => self.vfs.remove_file(first_name),
            0b0010 => self.vfs.rename_file(first_name, second_name_required()?),
            0b0011 => self.vfs.append_file(first_name, second_name_required()?),
            0b0100 => self.vfs.replace_file(first_name, second_name_required()?),
            0b0101 => self.vfs.create_dir(first_name),
            0b0110 => self.vfs.remove_dir(first_name, false),
            0b0111 => match self.vfs.remove_file(first_name) {
                Ok(()) | Err(FilestoreError::FileDoesNotExist) => Ok(()),
                Err(error) => Err(error),
            },
            0b1000 => match self.vfs.remove_dir(first_name, true) {
                Ok(()) | Err(FilestoreError::DirDoesNotExist) => Ok(()),
                Err(error) => Err(error),
            },
            _ => Err(FilestoreError::Other),
        }
    }

    fn for_each_option_tlv(
        &self,
        mut handler: impl FnMut(&Tlv),
    ) -> Result<(), DestError> {
        let options = &self.tparams.metadata_options;
        let mut idx = 0;
        while idx < options.len() {
            let tlv = Tlv::from_bytes(&options[idx..]).map_err(|_| DestError::TlvFormat)?;
            handler(&tlv);
            idx += tlv.len_full();
        }
        Ok(())
    }

    fn for_each_tlv_in(
        &self,
        options: &[u8],
        mut handler: impl FnMut(&Self, &Tlv),
    ) -> Result<(), DestError> {
        let mut idx = 0;
        while idx < options.len() {
            let tlv = Tlv::from_bytes(&options[idx..]).map_err(|_| DestError::TlvFormat)?;
            handler(self, &tlv);
            idx += tlv.len_full();
        }
        Ok(())
    }

    fn queue_eof_ack_pdu(&self) -> Result<(), DestError> {
        let ack_pdu = AckPdu::new(
            PduHeader::new_for_file_directive(self.tparams.pdu_conf, 0),
            FileDirectiveType::Eof,
            self.tparams.condition_code,
            TransactionStatus::Active,
        )
        .map_err(PduError::from)?;
        self.pdu_queue_helper(&ack_pdu)
    }

    fn queue_finished_pdu(&self) -> Result<(), DestError> {
        let pdu_header = PduHeader::new_for_file_directive(self.tparams.pdu_conf, 0);
        if self.tparams.condition_code == ConditionCode::NoError {
            let finished_pdu = FinishedPduCreator::new_no_error(
                pdu_header,
                self.tparams.delivery_code,
                self.tparams.file_status,
            );
            return self.pdu_queue_helper(&finished_pdu);
        }
        let fault_location = self
            .tparams
            .fault_location
            .clone()
            .unwrap_or_else(|| EntityIdTlv::new(self.local_cfg.id));
        let finished_pdu = FinishedPduCreator::new_with_error(
            pdu_header,
            self.tparams.condition_code,
            self.tparams.delivery_code,
            self.tparams.file_status,
            fault_location,
        );
        self.pdu_queue_helper(&finished_pdu)
    }

    fn queue_nak_pdus_for_lost_segments(&self) -> Result<(), DestError> {
        let file_size = self
            .tparams
            .fp
            .file_size
            .unwrap_or(self.tparams.fp.progress);
        let mut seg_reqs: SmallVec<[(u64, u64); 32]> = SmallVec::new();
        if self.tparams.acked_params.metadata_missing {
            seg_reqs.push((0, 0));
        }
        for segment in self.lost_segments.iter() {
            seg_reqs.push(segment);
        }
        if seg_reqs.is_empty() {
            return Ok(());
        }
        let max_segs_per_pdu = self.calculate_max_seg_reqs_per_nak_pdu();
        let num_batches = seg_reqs.len().div_ceil(max_segs_per_pdu);
        for (batch_idx, batch) in seg_reqs.chunks(max_segs_per_pdu).enumerate() {
            // The scope of the first batch is clamped to 0 and the scope of the last batch is
            // clamped to the file size.
            let start_of_scope = if batch_idx == 0 { 0 } else { batch[0].0 };
            let end_of_scope = if batch_idx == num_batches - 1 {
                file_size
            } else {
                batch[batch.len() - 1].1
            };
            self.queue_nak_pdu(batch, start_of_scope, end_of_scope)?;
        }
        Ok(())
    }

    fn queue_nak_pdu(
        &self,
        seg_reqs: &[(u64, u64)],
        start_of_scope: u64,
        end_of_scope: u64,
    ) -> Result<(), DestError> {
        let pdu_header = PduHeader::new_for_file_directive(self.tparams.pdu_conf, 0);
        if self.tparams.pdu_conf.file_flag == LargeFileFlag::Large {
            let nak_pdu = NakPduCreator::new_large_file_size(
                pdu_header,
                start_of_scope,
                end_of_scope,
                seg_reqs,
            )
            .map_err(PduError::from)?;
            return self.pdu_queue_helper(&nak_pdu);
        }
        let seg_reqs_u32: SmallVec<[(u32, u32); 32]> = seg_reqs
            .iter()
            .map(|seg| (seg.0 as u32, seg.1 as u32))
            .collect();
        let nak_pdu = NakPduCreator::new_normal_file_size(
            pdu_header,
            start_of_scope as u32,
            end_of_scope as u32,
            &seg_reqs_u32,
        )
        .map_err(PduError::from)?;
        self.pdu_queue_helper(&nak_pdu)
    }

    /// Calculate how many segment requests fit into a single NAK PDU for the maximum packet
    /// length of the remote entity configuration.
    fn calculate_max_seg_reqs_per_nak_pdu(&self) -> usize {
        // Fixed header portion: 4 bytes plus the two entity ID fields and the transaction
        // sequence number field.
        let header_len = 4
            + 2 * self.tparams.pdu_conf.source_id().size()
            + self.tparams.pdu_conf.transaction_seq_num.size();
        let seg_req_len = if self.tparams.pdu_conf.file_flag == LargeFileFlag::Large {
            16
        } else {
            8
        };
        // The data field contains the directive code and the start and end of scope fields.
        let fixed_len = header_len + 1 + seg_req_len;
        let max_packet_len = self.tparams.remote_cfg.as_ref().unwrap().max_packet_len;
        core::cmp::max(1, max_packet_len.saturating_sub(fixed_len) / seg_req_len)
    }

    fn pdu_queue_helper(
        &self,
        pdu: &(impl WritablePduPacket + CfdpPdu),
    ) -> Result<(), DestError> {
        let mut pdu_buffer_mut = self.pdu_and_cksum_buffer.borrow_mut();
        let written_len = pdu.write_to_bytes(&mut pdu_buffer_mut)?;
        let packet = PduOwnedWithInfo::new(
            pdu.pdu_type(),
            pdu.file_directive_type(),
            pdu_buffer_mut[0..written_len].to_vec(),
        );
        drop(pdu_buffer_mut);
        self.pdus_to_be_sent.borrow_mut().push_back(packet);
        self.state_helper
            .num_packets_ready
            .set(self.state_helper.num_packets_ready.get() + 1);
        Ok(())
    }
}
