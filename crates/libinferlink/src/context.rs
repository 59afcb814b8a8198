use inferlink_protocol::{ChatMessage, Interaction, InteractionId, InteractionStatus, Role};

use crate::error::BrokerError;

/// Interaction history of one group plus the interaction currently being worked on.
///
/// The active interaction is an id into `history`; the history owns it.
#[derive(Debug, Clone)]
pub struct ChatContext {
    system: String,
    history: Vec<Interaction>,
    active: Option<InteractionId>,
}

impl ChatContext {
    pub fn new(system: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            history: Vec::new(),
            active: None,
        }
    }

    pub fn history(&self) -> &[Interaction] {
        &self.history
    }

    pub fn active(&self) -> Option<&Interaction> {
        let id = self.active.as_ref()?;
        self.history.iter().find(|i| &i.id == id)
    }

    pub fn has_active(&self) -> bool {
        self.active.is_some()
    }

    /// Append a new interaction and make it the active one.
    pub fn create_interaction(
        &mut self,
        prompt: impl Into<String>,
    ) -> Result<&mut Interaction, BrokerError> {
        if self.active.is_some() {
            return Err(BrokerError::Request(
                "an interaction is already in progress".to_string(),
            ));
        }
        let interaction = Interaction::new(prompt);
        self.active = Some(interaction.id.clone());
        self.history.push(interaction);
        let last = self.history.len() - 1;
        Ok(&mut self.history[last])
    }

    /// Replace the prompt of an existing interaction, clear its response and
    /// make it the active one.
    pub fn edit_interaction(
        &mut self,
        id: &str,
        prompt: impl Into<String>,
    ) -> Result<&mut Interaction, BrokerError> {
        if self.active.is_some() {
            return Err(BrokerError::Request(
                "cannot edit while an interaction is in progress".to_string(),
            ));
        }
        let interaction = self
            .history
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or_else(|| BrokerError::NotFound(format!("interaction {id}")))?;
        interaction.prompt = prompt.into();
        interaction.response.clear();
        self.active = Some(interaction.id.clone());
        Ok(interaction)
    }

    /// Remove an interaction from the history. Returns it marked `deleted`
    /// with its text cleared.
    pub fn remove_interaction(&mut self, id: &str) -> Result<Interaction, BrokerError> {
        if self.active.as_deref() == Some(id) {
            return Err(BrokerError::Request(
                "cannot delete the interaction in progress".to_string(),
            ));
        }
        let pos = self
            .history
            .iter()
            .position(|i| i.id == id)
            .ok_or_else(|| BrokerError::NotFound(format!("interaction {id}")))?;
        let mut removed = self.history.remove(pos);
        removed.status = InteractionStatus::Deleted;
        removed.prompt.clear();
        removed.response.clear();
        Ok(removed)
    }

    fn active_mut(&mut self) -> Option<&mut Interaction> {
        let id = self.active.as_ref()?;
        self.history.iter_mut().find(|i| &i.id == id)
    }

    pub fn set_active_status(&mut self, status: InteractionStatus) -> Option<Interaction> {
        let interaction = self.active_mut()?;
        interaction.status = status;
        Some(interaction.clone())
    }

    pub fn append_to_active(&mut self, chunk: &str) -> Option<Interaction> {
        let interaction = self.active_mut()?;
        interaction.response.push_str(chunk);
        Some(interaction.clone())
    }

    /// Give the active interaction its terminal status and clear the slot.
    pub fn finish_active(&mut self, status: InteractionStatus) -> Option<Interaction> {
        let finished = self.set_active_status(status);
        self.active = None;
        finished
    }

    /// Messages for the worker: the system preamble, then every exchange in
    /// order, stopping after the active interaction's prompt.
    pub fn transcript(&self) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.history.len() * 2 + 1);
        if !self.system.is_empty() {
            messages.push(ChatMessage::new(Role::System, self.system.clone()));
        }
        for interaction in &self.history {
            messages.push(ChatMessage::new(Role::User, interaction.prompt.clone()));
            if self.active.as_ref() == Some(&interaction.id) {
                break;
            }
            messages.push(ChatMessage::new(
                Role::Assistant,
                interaction.response.clone(),
            ));
        }
        messages
    }
}
