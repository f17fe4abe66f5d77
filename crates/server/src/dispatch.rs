use std::{sync::Arc, time::Duration};

use tracing::error;

use lifecycle::{ScheduleOutcome, ScheduledSend};
use shared::{
    domain::{ConversationId, MessageId, SessionId},
    error::ApiError,
    protocol::{ClientCommand, ServerEvent},
};

use crate::{
    timers::TimerKey,
    AppState,
};

/// The one validated handler table: every inbound command maps to exactly
/// one lifecycle operation, one broadcast, and one acknowledgment. `None`
/// means the command was accepted but produced no immediate event (join,
/// deferred schedule).
pub async fn dispatch(
    state: &Arc<AppState>,
    session: Option<SessionId>,
    cmd: ClientCommand,
) -> Result<Option<ServerEvent>, ApiError> {
    match cmd {
        ClientCommand::JoinConversation { conversation_id } => {
            if let Some(session) = session {
                state.rooms.join(conversation_id, session).await;
            }
            Ok(None)
        }

        ClientCommand::CreateConversation {
            client_ref,
            participants,
            kind,
            topic,
            owner,
        } => {
            let event = lifecycle::create_conversation(
                &state.ctx,
                client_ref,
                &participants,
                kind,
                &topic,
                owner,
            )
            .await?;
            if let Some(conversation_id) = event.conversation_id() {
                state.rooms.broadcast(conversation_id, &event).await;
            }
            Ok(Some(event))
        }

        ClientCommand::Typing {
            conversation_id,
            user_id,
        } => {
            lifecycle::ensure_conversation(&state.ctx, conversation_id).await?;
            let event = lifecycle::typing(conversation_id, user_id, false);
            state.rooms.broadcast(conversation_id, &event).await;
            Ok(Some(event))
        }

        ClientCommand::StopTyping {
            conversation_id,
            user_id,
        } => {
            lifecycle::ensure_conversation(&state.ctx, conversation_id).await?;
            let event = lifecycle::typing(conversation_id, user_id, true);
            state.rooms.broadcast(conversation_id, &event).await;
            Ok(Some(event))
        }

        ClientCommand::SendMessage {
            client_ref,
            conversation_id,
            user_id,
            message,
        } => {
            apply_and_broadcast(state, conversation_id, |state| async move {
                lifecycle::send_message(&state.ctx, client_ref, conversation_id, user_id, &message)
                    .await
            })
            .await
        }

        ClientCommand::SendSecureMessage {
            client_ref,
            conversation_id,
            user_id,
            message,
            encryption_algorithm,
            signature,
        } => {
            apply_and_broadcast(state, conversation_id, |state| async move {
                lifecycle::send_secure_message(
                    &state.ctx,
                    client_ref,
                    conversation_id,
                    user_id,
                    &message,
                    &encryption_algorithm,
                    &signature,
                )
                .await
            })
            .await
        }

        ClientCommand::SendVoiceMessage {
            client_ref,
            conversation_id,
            user_id,
            media_url,
        }
        | ClientCommand::SendSticker {
            client_ref,
            conversation_id,
            user_id,
            media_url,
        } => {
            apply_and_broadcast(state, conversation_id, |state| async move {
                lifecycle::send_media_message(
                    &state.ctx,
                    client_ref,
                    conversation_id,
                    user_id,
                    &media_url,
                )
                .await
            })
            .await
        }

        ClientCommand::ReportMessage {
            client_ref,
            conversation_id,
            message_id,
            reporter_id,
            reason,
        } => {
            apply_and_broadcast(state, conversation_id, |state| async move {
                lifecycle::report_message(
                    &state.ctx,
                    client_ref,
                    conversation_id,
                    message_id,
                    reporter_id,
                    &reason,
                )
                .await
            })
            .await
        }

        ClientCommand::EditMessage {
            conversation_id,
            message_id,
            new_message,
        } => {
            apply_and_broadcast(state, conversation_id, |state| async move {
                lifecycle::edit_message(&state.ctx, conversation_id, message_id, &new_message).await
            })
            .await
        }

        ClientCommand::DeleteMessage {
            conversation_id,
            message_id,
        } => {
            delete(state, conversation_id, message_id, false).await
        }

        ClientCommand::UnsendMessage {
            conversation_id,
            message_id,
        } => {
            delete(state, conversation_id, message_id, true).await
        }

        ClientCommand::ForwardMessage {
            client_ref,
            from_conversation_id,
            to_conversation_id,
            message_id,
        } => {
            // Broadcast goes to the target room only; the source room never
            // hears about the forward.
            apply_and_broadcast(state, to_conversation_id, |state| async move {
                lifecycle::forward_message(
                    &state.ctx,
                    client_ref,
                    from_conversation_id,
                    to_conversation_id,
                    message_id,
                )
                .await
            })
            .await
        }

        ClientCommand::MessageRead {
            conversation_id,
            message_id,
            reader_id,
        } => {
            apply_and_broadcast(state, conversation_id, |state| async move {
                lifecycle::mark_read(&state.ctx, conversation_id, message_id, reader_id).await
            })
            .await
        }

        ClientCommand::PinMessage {
            conversation_id,
            message_id,
            pin,
            actor_id,
        } => {
            apply_and_broadcast(state, conversation_id, |state| async move {
                lifecycle::pin_message(&state.ctx, conversation_id, message_id, pin, actor_id).await
            })
            .await
        }

        ClientCommand::ReactionMessage {
            client_ref,
            conversation_id,
            message_id,
            emoji,
            reactor_id,
        } => {
            apply_and_broadcast(state, conversation_id, |state| async move {
                lifecycle::react(
                    &state.ctx,
                    client_ref,
                    conversation_id,
                    message_id,
                    &emoji,
                    reactor_id,
                )
                .await
            })
            .await
        }

        ClientCommand::ScheduleMessage {
            client_ref,
            conversation_id,
            user_id,
            message,
            scheduled_time,
        } => {
            let lock = state.rooms.write_lock(conversation_id).await;
            let _guard = lock.lock().await;
            let outcome = lifecycle::schedule_message(
                &state.ctx,
                client_ref,
                conversation_id,
                user_id,
                &message,
                scheduled_time,
            )
            .await?;
            match outcome {
                ScheduleOutcome::Sent(event) => {
                    state.rooms.broadcast(conversation_id, &event).await;
                    Ok(Some(event))
                }
                ScheduleOutcome::Deferred(scheduled) => {
                    arm_scheduled_send(state, scheduled);
                    Ok(None)
                }
            }
        }

        ClientCommand::SendEphemeralMessage {
            client_ref,
            conversation_id,
            user_id,
            message,
            expires_in_seconds,
        } => {
            let event = apply_and_broadcast(state, conversation_id, |state| async move {
                lifecycle::send_ephemeral_message(
                    &state.ctx,
                    client_ref,
                    conversation_id,
                    user_id,
                    &message,
                    expires_in_seconds,
                )
                .await
            })
            .await?;
            if let Some(ServerEvent::Message { message }) = &event {
                arm_ephemeral_expiry(
                    state,
                    conversation_id,
                    message.message_id,
                    Duration::from_secs(expires_in_seconds),
                );
            }
            Ok(event)
        }

        ClientCommand::CreatePoll {
            client_ref,
            conversation_id,
            user_id,
            question,
            options,
        } => {
            apply_and_broadcast(state, conversation_id, |state| async move {
                lifecycle::create_poll(
                    &state.ctx,
                    client_ref,
                    conversation_id,
                    user_id,
                    &question,
                    &options,
                )
                .await
            })
            .await
        }

        ClientCommand::VotePoll {
            client_ref,
            conversation_id,
            message_id,
            option_index,
            voter_id,
        } => {
            apply_and_broadcast(state, conversation_id, |state| async move {
                lifecycle::vote_poll(
                    &state.ctx,
                    client_ref,
                    conversation_id,
                    message_id,
                    option_index,
                    voter_id,
                )
                .await
            })
            .await
        }
    }
}

/// Serializes the operation behind the room's write lock, then fans the
/// resulting event out to every member session.
async fn apply_and_broadcast<F, Fut>(
    state: &Arc<AppState>,
    conversation_id: ConversationId,
    op: F,
) -> Result<Option<ServerEvent>, ApiError>
where
    F: FnOnce(Arc<AppState>) -> Fut,
    Fut: std::future::Future<Output = Result<ServerEvent, ApiError>>,
{
    let lock = state.rooms.write_lock(conversation_id).await;
    let _guard = lock.lock().await;
    let event = op(Arc::clone(state)).await?;
    state.rooms.broadcast(conversation_id, &event).await;
    Ok(Some(event))
}

async fn delete(
    state: &Arc<AppState>,
    conversation_id: ConversationId,
    message_id: MessageId,
    unsend: bool,
) -> Result<Option<ServerEvent>, ApiError> {
    let event = apply_and_broadcast(state, conversation_id, |state| async move {
        lifecycle::delete_message(&state.ctx, conversation_id, message_id, unsend).await
    })
    .await?;
    // A deleted ephemeral message must not fire its expiry later.
    state.timers.cancel(&TimerKey::Ephemeral(message_id));
    Ok(event)
}

fn arm_scheduled_send(state: &Arc<AppState>, scheduled: ScheduledSend) {
    let delay = (scheduled.fire_at - chrono::Utc::now())
        .to_std()
        .unwrap_or(Duration::ZERO);
    let timer_state = Arc::clone(state);
    let key = TimerKey::Scheduled(scheduled.client_ref);
    state.timers.arm(key, delay, async move {
        let conversation_id = scheduled.conversation_id;
        let lock = timer_state.rooms.write_lock(conversation_id).await;
        let _guard = lock.lock().await;
        match lifecycle::fire_scheduled(&timer_state.ctx, &scheduled).await {
            Ok(event) => timer_state.rooms.broadcast(conversation_id, &event).await,
            Err(err) => error!(
                conversation_id = conversation_id.0,
                %err,
                "scheduled send failed"
            ),
        }
    });
}

fn arm_ephemeral_expiry(
    state: &Arc<AppState>,
    conversation_id: ConversationId,
    message_id: MessageId,
    ttl: Duration,
) {
    let timer_state = Arc::clone(state);
    state
        .timers
        .arm(TimerKey::Ephemeral(message_id), ttl, async move {
            let lock = timer_state.rooms.write_lock(conversation_id).await;
            let _guard = lock.lock().await;
            match lifecycle::expire_ephemeral(&timer_state.ctx, conversation_id, message_id).await {
                Ok(Some(event)) => timer_state.rooms.broadcast(conversation_id, &event).await,
                Ok(None) => {}
                Err(err) => error!(
                    message_id = message_id.0,
                    %err,
                    "ephemeral expiry failed"
                ),
            }
        });
}
