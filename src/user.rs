//! # CFDP User Module
//!
//! This module provides the [CfdpUser] trait, which models the CFDP user indication surface
//! specified in chapter 3.4 of the CFDP standard. Both handlers call these indication
//! primitives synchronously from inside their state machine at well-defined transaction
//! milestones. A user implementation could for example forward this information to a
//! telemetry interface or to a GUI application.
use spacepackets::{
    cfdp::{
        pdu::{
            file_data::SegmentMetadata,
            finished::{DeliveryCode, FileStatus},
        },
        ConditionCode,
    },
    util::UnsignedByteField,
};

use super::TransactionId;

/// Parameters of the Transaction-Finished.indication in chapter 3.4.8 of the CFDP standard.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TransactionFinishedParams {
    pub id: TransactionId,
    pub condition_code: ConditionCode,
    pub delivery_code: DeliveryCode,
    pub file_status: FileStatus,
}

/// Parameters of the Metadata-Recv.indication in chapter 3.4.7 of the CFDP standard.
///
/// The message to user TLVs are passed as the raw options slice of the Metadata PDU. An empty
/// source or destination file name denotes a metadata only transaction.
#[derive(Debug)]
pub struct MetadataReceivedParams<'src_file, 'dest_file, 'msgs_to_user> {
    pub id: TransactionId,
    pub source_id: UnsignedByteField,
    pub file_size: u64,
    pub src_file_name: &'src_file str,
    pub dest_file_name: &'dest_file str,
    pub msgs_to_user: &'msgs_to_user [u8],
}

#[cfg(feature = "alloc")]
#[derive(Debug)]
pub struct OwnedMetadataRecvdParams {
    pub id: TransactionId,
    pub source_id: UnsignedByteField,
    pub file_size: u64,
    pub src_file_name: alloc::string::String,
    pub dest_file_name: alloc::string::String,
    pub msgs_to_user: alloc::vec::Vec<u8>,
}

#[cfg(feature = "alloc")]
impl From<&MetadataReceivedParams<'_, '_, '_>> for OwnedMetadataRecvdParams {
    fn from(params: &MetadataReceivedParams) -> Self {
        Self {
            id: params.id,
            source_id: params.source_id,
            file_size: params.file_size,
            src_file_name: params.src_file_name.into(),
            dest_file_name: params.dest_file_name.into(),
            msgs_to_user: params.msgs_to_user.into(),
        }
    }
}

/// Parameters of the File-Segment-Recv.indication in chapter 3.4.11 of the CFDP standard.
#[derive(Debug)]
pub struct FileSegmentRecvdParams<'seg_meta> {
    pub id: TransactionId,
    pub offset: u64,
    pub length: usize,
    pub segment_metadata: Option<&'seg_meta SegmentMetadata<'seg_meta>>,
}

/// This trait is the primary interface to pass user indications to the CFDP user.
///
/// Please note that there is a dedicated hook interface for the fault handler callbacks,
/// the [UserFaultHook][crate::UserFaultHook], which is part of the local entity
/// configuration.
pub trait CfdpUser {
    fn transaction_indication(&mut self, id: &TransactionId);

    fn eof_sent_indication(&mut self, id: &TransactionId);

    fn transaction_finished_indication(&mut self, finished_params: &TransactionFinishedParams);

    fn metadata_recvd_indication(&mut self, md_recvd_params: &MetadataReceivedParams);

    fn file_segment_recvd_indication(&mut self, segment_recvd_params: &FileSegmentRecvdParams);

    fn report_indication(&mut self, id: &TransactionId);

    fn suspended_indication(&mut self, id: &TransactionId, condition_code: ConditionCode);

    fn resumed_indication(&mut self, id: &TransactionId, progress: u64);

    fn fault_indication(
        &mut self,
        id: &TransactionId,
        condition_code: ConditionCode,
        progress: u64,
    );

    fn abandoned_indication(
        &mut self,
        id: &TransactionId,
        condition_code: ConditionCode,
        progress: u64,
    );

    fn eof_recvd_indication(&mut self, id: &TransactionId);
}
