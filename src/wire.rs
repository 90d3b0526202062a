use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, warn};

use crate::api::{self, BookingView, ErrorBody, Request, Response, ScheduleView};
use crate::auth::{PasswordAuth, Principal};
use crate::engine::{BookingRequest, Engine, EngineError, ScheduleFilter, WalkInRequest};
use crate::limits::MAX_REQUEST_LINE;
use crate::model::*;
use crate::notify::DomainEvent;

/// Serve one client: newline-delimited JSON requests in, one response line
/// per request out, plus pushed event lines while listening.
pub async fn process_connection<S>(socket: S, engine: Arc<Engine>, auth: Arc<PasswordAuth>) -> Result<(), LinesCodecError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_REQUEST_LINE));
    let mut principal: Option<Principal> = None;
    let mut events: Option<broadcast::Receiver<DomainEvent>> = None;

    loop {
        tokio::select! {
            line = framed.next() => {
                let line = match line {
                    None => return Ok(()),
                    Some(Ok(line)) => line,
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        let body = ErrorBody::new("limit_exceeded", "request line too long");
                        framed.send(Response::Error(body).to_line()).await?;
                        return Ok(());
                    }
                    Some(Err(e)) => return Err(e),
                };
                if line.trim().is_empty() {
                    continue;
                }

                let request: Request = match serde_json::from_str(&line) {
                    Ok(r) => r,
                    Err(e) => {
                        framed.send(Response::Error(ErrorBody::new("validation", e.to_string())).to_line()).await?;
                        continue;
                    }
                };

                let response = match request {
                    Request::Authenticate { password, principal: claimed } => {
                        match auth.authenticate(&password, claimed) {
                            Ok(p) => {
                                debug!("authenticated {p}");
                                let response = Response::ok(&p);
                                principal = Some(p);
                                response
                            }
                            Err(e) => {
                                metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
                                warn!("authentication failed: {e}");
                                framed.send(Response::Error(ErrorBody::new("auth", e.to_string())).to_line()).await?;
                                return Ok(());
                            }
                        }
                    }
                    request => match &principal {
                        None => Response::Error(ErrorBody::new("unauthenticated", "authenticate first")),
                        Some(p) => match request {
                            Request::Listen { room_id } => {
                                let subscribed = match room_id {
                                    Some(room) => Ok(engine.notify.subscribe_room(room)),
                                    None => p.ensure_staff("listen to every room").map(|()| engine.notify.subscribe_all()),
                                };
                                match subscribed {
                                    Ok(rx) => {
                                        events = Some(rx);
                                        Response::ok(serde_json::json!({ "listening": room_id }))
                                    }
                                    Err(e) => Response::Error(ErrorBody::from(&e)),
                                }
                            }
                            Request::Unlisten => {
                                events = None;
                                Response::ok(serde_json::json!({ "listening": null }))
                            }
                            request => {
                                let op = crate::observability::request_label(&request);
                                let start = std::time::Instant::now();
                                let result = execute(&engine, p, request).await;
                                let status = if result.is_ok() { "ok" } else { "error" };
                                metrics::counter!(crate::observability::REQUESTS_TOTAL, "op" => op, "status" => status).increment(1);
                                metrics::histogram!(crate::observability::REQUEST_DURATION_SECONDS, "op" => op)
                                    .record(start.elapsed().as_secs_f64());
                                match result {
                                    Ok(r) => r,
                                    Err(e) => {
                                        debug!("{op} by {p} failed: {e}");
                                        Response::Error(ErrorBody::from(&e))
                                    }
                                }
                            }
                        },
                    },
                };
                framed.send(response.to_line()).await?;
            }
            event = next_event(&mut events) => {
                match event {
                    Ok(event) => framed.send(Response::Event(event).to_line()).await?,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("listener lagged, {n} event(s) dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => events = None,
                }
            }
        }
    }
}

/// Pending forever when not listening, so `select!` only waits on requests.
async fn next_event(events: &mut Option<broadcast::Receiver<DomainEvent>>) -> Result<DomainEvent, broadcast::error::RecvError> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn bookings(list: Vec<Booking>) -> Vec<BookingView> {
    list.into_iter().map(BookingView::from).collect()
}

fn schedules(list: Vec<RoomSchedule>) -> Vec<ScheduleView> {
    list.into_iter().map(ScheduleView::from).collect()
}

async fn execute(engine: &Engine, by: &Principal, request: Request) -> Result<Response, EngineError> {
    let response = match request {
        Request::CreateBooking {
            size,
            start,
            end,
            rooms,
            contact,
            note,
            convert_now,
        } => {
            let request = BookingRequest {
                size,
                window: api::window(&start, end.as_ref())?,
                rooms,
                contact,
                note,
                convert_now,
            };
            Response::ok(BookingView::from(engine.create_booking(request, by).await?))
        }
        Request::ConvertBooking { id } => Response::ok(BookingView::from(engine.convert_booking(id, by).await?)),
        Request::CancelBooking { id, reason } => {
            Response::ok(BookingView::from(engine.cancel_booking(id, reason, by).await?))
        }
        Request::ModifyBooking { id, start, end } => {
            let window = api::window(&start, end.as_ref())?;
            Response::ok(BookingView::from(engine.modify_booking(id, window, by).await?))
        }
        Request::ReserveWalkIn {
            room_id,
            start,
            end,
            note,
        } => {
            let request = WalkInRequest {
                room_id,
                window: api::window(&start, end.as_ref())?,
                note,
            };
            Response::ok(ScheduleView::from(engine.reserve_walk_in(request, by).await?))
        }
        Request::StartSchedule { id } => Response::ok(ScheduleView::from(engine.start_schedule(id, by).await?)),
        Request::FinishSchedule { id } => Response::ok(ScheduleView::from(engine.finish_schedule(id, by).await?)),
        Request::CancelSchedule { id, reason } => {
            Response::ok(ScheduleView::from(engine.cancel_schedule(id, reason, by).await?))
        }
        Request::SetScheduleEnd { id, end } => {
            let end = end.as_ref().map(api::to_ms);
            Response::ok(ScheduleView::from(engine.set_schedule_end(id, end, by).await?))
        }
        Request::PutPhysicalRoom { id, name } => {
            let room = PhysicalRoom { id, name };
            engine.put_physical_room(room.clone(), by).await?;
            Response::ok(room)
        }
        Request::PutVirtualRoom { room } => {
            engine.put_virtual_room(room.clone(), by).await?;
            Response::ok(room)
        }
        Request::PutVirtualRooms { rooms } => {
            engine.put_virtual_rooms(rooms.clone(), by).await?;
            Response::ok(rooms)
        }
        Request::DeactivateVirtualRoom { id } => Response::ok(engine.deactivate_virtual_room(id, by).await?),
        Request::GetBooking { id } => Response::ok(BookingView::from(engine.get_booking(id).await?)),
        Request::ListBookings { status } => Response::ok(bookings(engine.list_bookings(status).await?)),
        Request::GetSchedule { id } => Response::ok(ScheduleView::from(engine.get_schedule(id).await?)),
        Request::ListSchedules {
            room_id,
            status,
            booking_id,
            start,
            end,
        } => {
            let window = match (start, end) {
                (Some(start), end) => Some(api::window(&start, end.as_ref())?),
                (None, Some(_)) => return Err(EngineError::Validation("end given without start".into())),
                (None, None) => None,
            };
            let filter = ScheduleFilter {
                room_id,
                status,
                window,
                booking_id,
            };
            Response::ok(schedules(engine.list_schedules(&filter).await?))
        }
        Request::ListVirtualRooms { size } => Response::ok(engine.list_virtual_rooms(size).await?),
        Request::ListPhysicalRooms => Response::ok(engine.list_physical_rooms().await?),
        Request::Allocate { size, start, end } => {
            let window = api::window(&start, end.as_ref())?;
            Response::ok(engine.preview_allocation(size, window).await?)
        }
        Request::Authenticate { .. } | Request::Listen { .. } | Request::Unlisten => {
            return Err(EngineError::Validation("not a data operation".into()));
        }
    };
    Ok(response)
}
