use chrono::{Datelike, Months, NaiveDate};
use rocket::data::{Data, ToByteUnit};
use rocket::http::{ContentType, Status};
use rocket::response::{self, Responder};
use rocket::serde::json::Json;
use rocket::{Catcher, Request, Route, State};
use serde_json::json;
use uuid::Uuid;

use crate::balance::{CategoryTotal, DateRange, Debt, MonthTotal, UserTotals};
use crate::error::{ErrorClass, LedgerError};
use crate::expense::PaymentReceipt;
use crate::models::*;
use crate::money::{Currency, Money};
use crate::ocr::{ticket_total, TicketScanError, TicketScanner};
use crate::service::{CreateExpense, LedgerService, RequestContext};
use crate::split::SplitPolicy;

/// Ticket scanning collaborator plus the upload cap.
pub struct TicketIntake {
    pub scanner: Box<dyn TicketScanner>,
    pub max_bytes: u64,
}

/// Error response: status plus a JSON body naming the failure.
#[derive(Debug)]
pub struct ApiError {
    status: Status,
    body: ErrorBody,
}

impl<'r> Responder<'r, 'static> for ApiError {
    fn respond_to(self, request: &'r Request<'_>) -> response::Result<'static> {
        (self.status, Json(self.body)).respond_to(request)
    }
}

fn class_name(class: ErrorClass) -> &'static str {
    match class {
        ErrorClass::Validation => "validation",
        ErrorClass::Conflict => "conflict",
        ErrorClass::Policy => "policy",
        ErrorClass::NotFound => "not_found",
        ErrorClass::Internal => "internal",
    }
}

fn details(error: &LedgerError) -> serde_json::Value {
    match error {
        LedgerError::InvalidParticipants { user_id, .. } => json!({ "user_id": user_id }),
        LedgerError::SplitSumMismatch { expected, actual } => {
            json!({ "expected": expected, "actual": actual })
        }
        LedgerError::NonPositiveAmount { amount } => json!({ "amount": amount }),
        LedgerError::Overpayment {
            user_id,
            attempted,
            remaining,
        } => json!({ "user_id": user_id, "attempted": attempted, "remaining": remaining }),
        LedgerError::ExpenseNotFound(expense_id)
        | LedgerError::ExpenseCancelled(expense_id)
        | LedgerError::ConcurrentModification { expense_id }
        | LedgerError::ExpenseNotDeletable { expense_id, .. } => json!({ "expense_id": expense_id }),
        LedgerError::ShareNotFound {
            expense_id,
            user_id,
        }
        | LedgerError::ShareAlreadyPaid {
            expense_id,
            user_id,
        } => json!({ "expense_id": expense_id, "user_id": user_id }),
        LedgerError::NotAuthorized { user_id } => json!({ "user_id": user_id }),
        LedgerError::InvalidPeriod { start, end, reason } => {
            json!({ "start": start, "end": end, "reason": reason })
        }
        _ => serde_json::Value::Null,
    }
}

impl From<LedgerError> for ApiError {
    fn from(error: LedgerError) -> Self {
        let class = error.class();
        let status = match (&error, class) {
            (LedgerError::NotAuthorized { .. }, _) => Status::Forbidden,
            (_, ErrorClass::Validation) => Status::UnprocessableEntity,
            (_, ErrorClass::Conflict) | (_, ErrorClass::Policy) => Status::Conflict,
            (_, ErrorClass::NotFound) => Status::NotFound,
            (_, ErrorClass::Internal) => Status::InternalServerError,
        };

        let message = if class == ErrorClass::Internal {
            tracing::error!(error = %error, "request failed");
            "internal error".to_string()
        } else {
            tracing::debug!(error = %error, code = error.code(), "request rejected");
            error.to_string()
        };

        ApiError {
            status,
            body: ErrorBody {
                error: error.code(),
                kind: class_name(class),
                message,
                details: details(&error),
            },
        }
    }
}

impl From<TicketScanError> for ApiError {
    fn from(error: TicketScanError) -> Self {
        let (status, code) = match &error {
            TicketScanError::NotConfigured => (Status::ServiceUnavailable, "scanner_unavailable"),
            TicketScanError::TooLarge { .. } => (Status::PayloadTooLarge, "ticket_too_large"),
            TicketScanError::Empty => (Status::UnprocessableEntity, "ticket_empty"),
            TicketScanError::Http(_)
            | TicketScanError::Rejected { .. }
            | TicketScanError::InvalidAmount(_)
            | TicketScanError::Money(_) => (Status::BadGateway, "scanner_failed"),
        };
        tracing::warn!(error = %error, "ticket scan failed");
        ApiError {
            status,
            body: ErrorBody {
                error: code,
                kind: "external",
                message: error.to_string(),
                details: serde_json::Value::Null,
            },
        }
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn parse_id(raw: &str) -> Result<Uuid, LedgerError> {
    Uuid::parse_str(raw).map_err(|_| LedgerError::InvalidInput(format!("{raw:?} is not a valid id")))
}

fn parse_money(raw: &str, currency: Currency) -> Result<Money, LedgerError> {
    Money::parse(raw, currency).map_err(|e| LedgerError::InvalidAmount(e.to_string()))
}

fn parse_date(raw: &str) -> Result<NaiveDate, LedgerError> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| LedgerError::InvalidInput(format!("{raw:?} is not a YYYY-MM-DD date")))
}

/// `from`/`to` query window; defaults to the twelve calendar months ending today.
fn period(service: &LedgerService, from: Option<&str>, to: Option<&str>) -> Result<DateRange, LedgerError> {
    let end = match to {
        Some(raw) => parse_date(raw)?,
        None => service.today(),
    };
    let start = match from {
        Some(raw) => parse_date(raw)?,
        None => end
            .with_day(1)
            .and_then(|first| first.checked_sub_months(Months::new(11)))
            .unwrap_or(end),
    };
    DateRange::new(start, end)
}

fn split_policy(split: SplitRequest, currency: Currency) -> Result<SplitPolicy, LedgerError> {
    Ok(match split {
        SplitRequest::Equal { include_payer } => SplitPolicy::Equal { include_payer },
        SplitRequest::Custom { amounts } => SplitPolicy::Custom {
            amounts: amounts
                .into_iter()
                .map(|(user_id, raw)| parse_money(&raw, currency).map(|amount| (user_id, amount)))
                .collect::<Result<_, LedgerError>>()?,
        },
    })
}

// Health check
#[get("/health")]
fn health() -> &'static str {
    "OK"
}

#[post("/expenses", data = "<request>")]
async fn create_expense(
    ctx: RequestContext,
    service: &State<LedgerService>,
    request: Json<CreateExpenseRequest>,
) -> Result<(Status, Json<ExpenseResponse>), ApiError> {
    let request = request.into_inner();
    let currency = match &request.currency {
        Some(code) => code
            .parse::<Currency>()
            .map_err(|e| LedgerError::InvalidAmount(e.to_string()))?,
        None => service.currency(),
    };

    let input = CreateExpense {
        description: request.description,
        category: request.category,
        total_amount: parse_money(&request.amount, currency)?,
        payer_id: request.payer_id,
        participants: request.participant_ids,
        policy: split_policy(request.split, currency)?,
        occurred_at: request.occurred_at,
    };
    let expense = service.create_expense(&ctx, input).await?;
    Ok((Status::Created, Json(ExpenseResponse::from(&expense))))
}

#[get("/expenses")]
async fn list_expenses(ctx: RequestContext, service: &State<LedgerService>) -> ApiResult<Vec<ExpenseResponse>> {
    let expenses = service.group_expenses(&ctx).await?;
    Ok(Json(expenses.iter().map(ExpenseResponse::from).collect()))
}

#[get("/expenses/<expense_id>")]
async fn get_expense(
    ctx: RequestContext,
    service: &State<LedgerService>,
    expense_id: &str,
) -> ApiResult<ExpenseResponse> {
    let expense = service.expense(&ctx, parse_id(expense_id)?).await?;
    Ok(Json(ExpenseResponse::from(&expense)))
}

#[post("/expenses/<expense_id>/payments", data = "<request>")]
async fn record_payment(
    ctx: RequestContext,
    service: &State<LedgerService>,
    expense_id: &str,
    request: Json<RecordPaymentRequest>,
) -> ApiResult<PaymentReceipt> {
    let expense_id = parse_id(expense_id)?;
    let amount = parse_money(&request.amount, service.currency())?;
    let share_user_id = request.user_id.unwrap_or(ctx.requester_id);
    let receipt = service
        .record_payment(&ctx, expense_id, share_user_id, amount, request.kind)
        .await?;
    Ok(Json(receipt))
}

#[post("/expenses/<expense_id>/shares/<user_id>/settle")]
async fn settle_share(
    ctx: RequestContext,
    service: &State<LedgerService>,
    expense_id: &str,
    user_id: &str,
) -> ApiResult<PaymentReceipt> {
    let receipt = service
        .settle_share(&ctx, parse_id(expense_id)?, parse_id(user_id)?)
        .await?;
    Ok(Json(receipt))
}

#[get("/expenses/<expense_id>/shares/<user_id>/payments")]
async fn payment_history(
    ctx: RequestContext,
    service: &State<LedgerService>,
    expense_id: &str,
    user_id: &str,
) -> ApiResult<Vec<PaymentHistoryItem>> {
    let history = service
        .payment_history(&ctx, parse_id(expense_id)?, parse_id(user_id)?)
        .await?;
    Ok(Json(history))
}

#[delete("/expenses/<expense_id>")]
async fn cancel_expense(
    ctx: RequestContext,
    service: &State<LedgerService>,
    expense_id: &str,
) -> ApiResult<ExpenseResponse> {
    let expense = service.cancel_expense(&ctx, parse_id(expense_id)?).await?;
    Ok(Json(ExpenseResponse::from(&expense)))
}

#[get("/balances/<other_user_id>")]
async fn pairwise_balance(
    ctx: RequestContext,
    service: &State<LedgerService>,
    other_user_id: &str,
) -> ApiResult<PairwiseBalanceResponse> {
    let other_user_id = parse_id(other_user_id)?;
    let balance = service.pairwise_balance(&ctx, other_user_id).await?;
    Ok(Json(PairwiseBalanceResponse {
        group_id: ctx.group_id,
        user_id: ctx.requester_id,
        other_user_id,
        balance,
    }))
}

#[get("/groups/current/balances")]
async fn group_balances(ctx: RequestContext, service: &State<LedgerService>) -> ApiResult<Vec<Balance>> {
    Ok(Json(service.group_balances(&ctx).await?))
}

#[get("/groups/current/debts")]
async fn group_debts(ctx: RequestContext, service: &State<LedgerService>) -> ApiResult<Vec<Debt>> {
    Ok(Json(service.group_debts(&ctx).await?))
}

#[get("/me/totals")]
async fn user_totals(ctx: RequestContext, service: &State<LedgerService>) -> ApiResult<UserTotals> {
    Ok(Json(service.user_totals(&ctx).await?))
}

#[get("/me/categories?<from>&<to>")]
async fn category_breakdown(
    ctx: RequestContext,
    service: &State<LedgerService>,
    from: Option<&str>,
    to: Option<&str>,
) -> ApiResult<Vec<CategoryTotal>> {
    let period = period(service, from, to)?;
    Ok(Json(service.category_breakdown(&ctx, period).await?))
}

#[get("/me/trend?<from>&<to>")]
async fn monthly_trend(
    ctx: RequestContext,
    service: &State<LedgerService>,
    from: Option<&str>,
    to: Option<&str>,
) -> ApiResult<Vec<MonthTotal>> {
    let range = period(service, from, to)?;
    Ok(Json(service.monthly_trend(&ctx, range).await?))
}

#[post("/tickets/scan", data = "<image>")]
async fn scan_ticket(
    _ctx: RequestContext,
    service: &State<LedgerService>,
    tickets: &State<TicketIntake>,
    content_type: Option<&ContentType>,
    image: Data<'_>,
) -> ApiResult<TicketScanResponse> {
    let limit = tickets.max_bytes;
    let upload = image
        .open(limit.bytes())
        .into_bytes()
        .await
        .map_err(|e| LedgerError::InvalidInput(format!("could not read upload: {e}")))?;
    if !upload.is_complete() {
        return Err(TicketScanError::TooLarge { limit }.into());
    }

    let content_type = content_type
        .map(|ct| ct.to_string())
        .unwrap_or_else(|| "application/octet-stream".to_string());
    let items = tickets.scanner.scan(&upload.into_inner(), &content_type).await?;
    let total = ticket_total(&items, service.currency()).map_err(LedgerError::from)?;

    Ok(Json(TicketScanResponse {
        items: items
            .into_iter()
            .map(|item| TicketItemView {
                label: item.label,
                amount: item.amount,
            })
            .collect(),
        total,
    }))
}

#[catch(401)]
fn unauthorized() -> Json<ErrorBody> {
    Json(ErrorBody {
        error: "unauthorized",
        kind: "auth",
        message: "a valid bearer token is required".to_string(),
        details: serde_json::Value::Null,
    })
}

#[catch(422)]
fn unprocessable() -> Json<ErrorBody> {
    Json(ErrorBody {
        error: "malformed_request",
        kind: "validation",
        message: "the request body could not be read".to_string(),
        details: serde_json::Value::Null,
    })
}

pub fn get_routes() -> Vec<Route> {
    routes![
        health,
        create_expense,
        list_expenses,
        get_expense,
        record_payment,
        settle_share,
        payment_history,
        cancel_expense,
        pairwise_balance,
        group_balances,
        group_debts,
        user_totals,
        category_breakdown,
        monthly_trend,
        scan_ticket
    ]
}

pub fn get_catchers() -> Vec<Catcher> {
    catchers![unauthorized, unprocessable]
}
