use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use thiserror::Error;

use crate::{CouponId, IssueError, MemberCouponId, MemberId, NewCoupon};

/// Errors that can occur when reading or writing csv files
#[derive(Debug, Error)]
pub enum CsvError {
    #[error("failed to open {path}: {source}")]
    Open { path: String, source: csv::Error },

    #[error("line {line}: failed to parse row: {source}")]
    Parse { line: usize, source: csv::Error },

    #[error("line {line}: coupon title is empty")]
    EmptyTitle { line: usize },

    #[error("failed to write outcomes: {0}")]
    Write(#[from] csv::Error),

    #[error("failed to flush outcomes: {0}")]
    Flush(#[from] io::Error),
}

#[derive(Debug, Deserialize)]
struct CouponRow {
    title: String,
    discount: u32,
    /// Empty for an unlimited coupon.
    total: Option<u32>,
}

/// One issuance request from the requests file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct IssueRequest {
    pub coupon: CouponId,
    pub member: MemberId,
}

#[derive(Debug, Serialize)]
struct OutcomeRow {
    coupon: CouponId,
    member: MemberId,
    status: &'static str,
    detail: String,
}

fn reader(path: &Path) -> Result<csv::Reader<std::fs::File>, CsvError> {
    csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|source| CsvError::Open {
            path: path.display().to_string(),
            source,
        })
}

/// Read coupon definitions (`title,discount,total`) from a csv file
pub fn read_coupons(
    path: impl AsRef<Path>,
) -> Result<impl Iterator<Item = Result<NewCoupon, CsvError>>, CsvError> {
    let rows = reader(path.as_ref())?
        .into_deserialize::<CouponRow>()
        .enumerate()
        .map(|(idx, result)| {
            let line = idx + 2; // 1-indexed, skip header
            let row = result.map_err(|source| CsvError::Parse { line, source })?;
            if row.title.is_empty() {
                return Err(CsvError::EmptyTitle { line });
            }
            Ok(NewCoupon::new(row.title, row.discount, row.total))
        });
    Ok(rows)
}

/// Read issuance requests (`coupon,member`) from a csv file
pub fn read_requests(
    path: impl AsRef<Path>,
) -> Result<impl Iterator<Item = Result<IssueRequest, CsvError>>, CsvError> {
    let rows = reader(path.as_ref())?
        .into_deserialize::<IssueRequest>()
        .enumerate()
        .map(|(idx, result)| {
            let line = idx + 2;
            result.map_err(|source| CsvError::Parse { line, source })
        });
    Ok(rows)
}

/// Write one row per request outcome to `writer` in csv format
pub fn write_outcomes(
    writer: impl io::Write,
    outcomes: impl IntoIterator<Item = (IssueRequest, Result<MemberCouponId, IssueError>)>,
) -> Result<(), CsvError> {
    let mut writer = csv::Writer::from_writer(writer);

    for (request, result) in outcomes {
        let (status, detail) = match result {
            Ok(member_coupon) => ("SUCCESS", member_coupon.to_string()),
            Err(IssueError::Timeout(_)) => ("UNKNOWN", "timeout".to_string()),
            Err(e) => ("FAILURE", e.reason().as_str().to_string()),
        };
        writer.serialize(OutcomeRow {
            coupon: request.coupon,
            member: request.member,
            status,
            detail,
        })?;
    }

    writer.flush()?;
    Ok(())
}
