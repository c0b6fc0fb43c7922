//! Message dispatch on a storage node

use crate::common::message::encode_records;
use crate::common::utils::display_bytes;
use crate::common::{Error, Message, Op, Response, Result};
use crate::node::storage::StorageProvider;

/// Apply one message to `storage` and build the reply.
///
/// Write-style operations answer `Ok` with a one-byte flag (1 = the key or
/// family was written or existed). Reads and streams of something absent
/// answer `NotFound`. Storage failures answer `Error` with the reason.
pub fn handle(storage: &dyn StorageProvider, msg: Message) -> Response {
    let id = msg.id;
    let op = msg.op;
    match apply(storage, msg) {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!("{} {} failed: {}", op, id, e);
            Response::error(id, e.to_string())
        }
    }
}

fn required(field: Option<Vec<u8>>, name: &str, op: Op) -> Result<Vec<u8>> {
    match field {
        Some(bytes) if !bytes.is_empty() => Ok(bytes),
        _ => Err(Error::InvalidArgument(format!("{} requires a {}", op, name))),
    }
}

fn flag(value: bool) -> Option<Vec<u8>> {
    Some(vec![value as u8])
}

fn apply(storage: &dyn StorageProvider, msg: Message) -> Result<Response> {
    let Message {
        id,
        op,
        col_fam,
        key,
        value,
    } = msg;
    if col_fam.is_empty() {
        return Err(Error::InvalidArgument(format!(
            "{} requires a column family",
            op
        )));
    }

    match op {
        Op::Write => {
            let key = required(key, "key", op)?;
            let value = required(value, "value", op)?;
            Ok(Response::ok(id, flag(storage.write(&col_fam, &key, &value)?)))
        }
        Op::Read => {
            let key = required(key, "key", op)?;
            match storage.read(&col_fam, &key)? {
                Some(value) => Ok(Response::ok(id, Some(value))),
                None => Ok(Response::not_found(id)),
            }
        }
        Op::Delete => {
            let key = required(key, "key", op)?;
            Ok(Response::ok(id, flag(storage.delete(&col_fam, &key)?)))
        }
        Op::DeleteColFam => Ok(Response::ok(
            id,
            flag(storage.delete_column_family(&col_fam)?),
        )),
        Op::TsWrite => {
            let blob = required(value, "value", op)?;
            if let Some(key) = &key {
                tracing::trace!(
                    "TS_WRITE of {} bytes for {} into {}",
                    blob.len(),
                    display_bytes(key),
                    display_bytes(&col_fam)
                );
            }
            let token = storage.batch_write(&col_fam, &blob)?;
            Ok(Response::ok(id, Some(token)))
        }
        Op::Stream => match storage.stream(&col_fam, value.as_deref())? {
            Some(records) => Ok(Response::ok(
                id,
                Some(encode_records(
                    records.iter().map(|(k, v)| (k.as_slice(), v.as_slice())),
                )),
            )),
            None => Ok(Response::not_found(id)),
        },
    }
}
